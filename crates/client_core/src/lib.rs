use std::sync::{Arc, Weak};

use shared::{
    domain::{ConversationId, DriverProfileId, MessageId, Role, UserId, Viewer},
    error::ApiError,
    protocol::{
        ChangeEvent, ChangeFilter, ChangeKind, Conversation, Message, NewMessage, SubscriptionId,
        Table,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod error;
pub mod read_tracker;
pub mod registry;
pub mod stream;
pub mod subscription;

pub use backend::{
    ChangeFeed, ConversationScope, DataService, FeedSubscription, LocalBackend,
    MissingChangeFeed, RealtimeFeed, RestConfig, RestDataService,
};
pub use error::MessagingError;

use read_tracker::ReadTracker;
use registry::ConversationRegistry;
use stream::{AppendOutcome, MessageStream};
use subscription::{ActiveSubscription, ListWatch, SubscriptionSlot};

pub const DEFAULT_MESSAGE_WINDOW: u32 = stream::MAX_MESSAGE_WINDOW;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagingConfig {
    /// Messages fetched when a conversation is opened.
    pub message_window: u32,
}

impl MessagingConfig {
    pub fn with_message_window(message_window: u32) -> Self {
        Self {
            message_window: stream::clamp_window(message_window),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            message_window: DEFAULT_MESSAGE_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsUpdated(Vec<Conversation>),
    ConversationRemoved(ConversationId),
    MessagesReplaced {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageAppended {
        message: Message,
        index: usize,
    },
    ConversationRead {
        conversation_id: ConversationId,
        role: Role,
    },
    Error(String),
}

/// Result of a list fetch. On failure `conversations` is the previous
/// cache and `error` says why it was not refreshed.
#[derive(Debug, Clone)]
pub struct ConversationListing {
    pub conversations: Vec<Conversation>,
    pub error: Option<ApiError>,
}

pub struct MessagingClient {
    backend: Arc<dyn DataService>,
    feed: Arc<dyn ChangeFeed>,
    config: MessagingConfig,
    inner: Mutex<MessagingState>,
    // Lock order: `active_subscription` before `inner`.
    active_subscription: Mutex<SubscriptionSlot>,
    list_watch: Mutex<Option<ListWatch>>,
    events: broadcast::Sender<ClientEvent>,
}

struct MessagingState {
    viewer: Option<Viewer>,
    registry: ConversationRegistry,
    stream: MessageStream,
    read_tracker: ReadTracker,
}

impl MessagingClient {
    pub fn new(
        backend: Arc<dyn DataService>,
        feed: Arc<dyn ChangeFeed>,
        config: MessagingConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            feed,
            config: MessagingConfig::with_message_window(config.message_window),
            inner: Mutex::new(MessagingState {
                viewer: None,
                registry: ConversationRegistry::default(),
                stream: MessageStream::default(),
                read_tracker: ReadTracker::default(),
            }),
            active_subscription: Mutex::new(SubscriptionSlot::default()),
            list_watch: Mutex::new(None),
            events,
        })
    }

    pub fn new_local(backend: Arc<LocalBackend>, config: MessagingConfig) -> Arc<Self> {
        Self::new(backend.clone(), backend, config)
    }

    /// REST queries without a push feed; conversations still load but
    /// nothing updates live.
    pub fn new_without_feed(backend: Arc<dyn DataService>, config: MessagingConfig) -> Arc<Self> {
        Self::new(backend, Arc::new(MissingChangeFeed), config)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> MessagingConfig {
        self.config
    }

    pub async fn sign_in(&self, viewer: Viewer) {
        self.sign_out().await;
        self.inner.lock().await.viewer = Some(viewer);
        info!(
            user_id = %viewer.user_id,
            role = viewer.role.as_str(),
            "messaging: signed in"
        );
    }

    pub async fn sign_out(&self) {
        self.active_subscription.lock().await.close();
        self.list_watch.lock().await.take();
        let mut guard = self.inner.lock().await;
        if let Some(viewer) = guard.viewer.take() {
            info!(user_id = %viewer.user_id, "messaging: signed out");
        }
        guard.registry.reset();
        guard.stream.deactivate();
    }

    pub async fn viewer(&self) -> Option<Viewer> {
        self.inner.lock().await.viewer
    }

    async fn require_viewer(&self) -> Result<Viewer, MessagingError> {
        self.viewer().await.ok_or(MessagingError::NotSignedIn)
    }

    async fn cache_viewer(&self, resolved: Viewer) {
        let mut guard = self.inner.lock().await;
        if guard.viewer.map(|v| v.user_id) == Some(resolved.user_id) {
            guard.viewer = Some(resolved);
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.registry.conversations().to_vec()
    }

    pub async fn conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.inner
            .lock()
            .await
            .registry
            .get(conversation_id)
            .cloned()
    }

    pub async fn last_list_error(&self) -> Option<ApiError> {
        self.inner.lock().await.registry.last_error().cloned()
    }

    /// Unread messages across every cached conversation, for the signed-in role.
    pub async fn total_unread(&self) -> u32 {
        let guard = self.inner.lock().await;
        guard
            .viewer
            .map_or(0, |viewer| guard.registry.total_unread(viewer.role))
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.stream.active()
    }

    pub async fn active_messages(&self) -> Vec<Message> {
        self.inner.lock().await.stream.messages().to_vec()
    }

    pub async fn has_conversation_subscription(&self) -> bool {
        self.active_subscription.lock().await.is_open()
    }

    pub async fn is_watching_conversation_list(&self) -> bool {
        self.list_watch.lock().await.is_some()
    }

    /// Refetches the conversation list. A backend failure is not an error
    /// here: the previous cache comes back with `error` set.
    pub async fn list_conversations(&self) -> Result<ConversationListing, MessagingError> {
        let viewer = self.require_viewer().await?;
        let generation = self.inner.lock().await.registry.begin_refresh();

        let fetched = match registry::resolve_scope(self.backend.as_ref(), viewer).await {
            Ok((scope, resolved)) => {
                self.cache_viewer(resolved).await;
                self.backend.list_conversations(scope).await
            }
            Err(MessagingError::Backend(err)) => Err(err),
            Err(err) => return Err(err),
        };
        if let Err(err) = &fetched {
            warn!(user_id = %viewer.user_id, "messaging: conversation list fetch failed: {err}");
        }

        let succeeded = fetched.is_ok();
        let (applied, listing) = {
            let mut guard = self.inner.lock().await;
            if guard.viewer.map(|v| v.user_id) != Some(viewer.user_id) {
                return Err(MessagingError::NotSignedIn);
            }
            let applied = guard.registry.apply_refresh(generation, fetched);
            let listing = ConversationListing {
                conversations: guard.registry.conversations().to_vec(),
                error: guard.registry.last_error().cloned(),
            };
            (applied, listing)
        };

        if applied && succeeded {
            let _ = self
                .events
                .send(ClientEvent::ConversationsUpdated(listing.conversations.clone()));
        }
        Ok(listing)
    }

    fn schedule_list_refresh(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.list_conversations().await {
                debug!("messaging: background list refresh skipped: {err}");
            }
        });
    }

    /// Loads the newest window of messages, subscribes to new ones and marks
    /// the conversation read. Any previously open conversation is closed
    /// first. Returns the messages as loaded.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, MessagingError> {
        self.require_viewer().await?;

        // No older open may install its subscription between close and activate.
        let (generation, known) = {
            let mut slot = self.active_subscription.lock().await;
            slot.close();
            let mut guard = self.inner.lock().await;
            let generation = guard.stream.activate(conversation_id);
            (generation, guard.registry.get(conversation_id).is_some())
        };
        info!(conversation_id = %conversation_id, "messaging: opening conversation");

        if !known {
            match self.backend.fetch_conversation(conversation_id).await {
                Ok(Some(conversation)) => self.inner.lock().await.registry.upsert(conversation),
                Ok(None) => {
                    self.deactivate_if_current(generation).await;
                    return Err(MessagingError::ConversationNotFound(conversation_id));
                }
                Err(err) => {
                    self.deactivate_if_current(generation).await;
                    return Err(err.into());
                }
            }
        }

        let fetched = match self
            .backend
            .list_messages(conversation_id, self.config.message_window)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation_id = %conversation_id, "messaging: message load failed: {err}");
                self.deactivate_if_current(generation).await;
                return Err(err.into());
            }
        };

        let loaded = {
            let mut guard = self.inner.lock().await;
            if guard.stream.replace(generation, fetched.clone()) {
                Some(guard.stream.messages().to_vec())
            } else {
                None
            }
        };
        let Some(loaded) = loaded else {
            debug!(conversation_id = %conversation_id, "messaging: open superseded by another conversation");
            return Ok(fetched);
        };
        let _ = self.events.send(ClientEvent::MessagesReplaced {
            conversation_id,
            messages: loaded.clone(),
        });

        // Rows inserted between the load above and this subscribe are not
        // delivered; they appear on the next open.
        match self.feed.subscribe(ChangeFilter::messages_in(conversation_id)).await {
            Ok(subscription) => {
                self.install_conversation_subscription(conversation_id, generation, subscription)
                    .await
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "messaging: live updates unavailable: {err}");
                let _ = self
                    .events
                    .send(ClientEvent::Error(MessagingError::Subscription(err).to_string()));
            }
        }

        self.mark_read(conversation_id).await;
        Ok(loaded)
    }

    async fn deactivate_if_current(&self, generation: u64) {
        let mut guard = self.inner.lock().await;
        if guard.stream.is_current(generation) {
            guard.stream.deactivate();
        }
    }

    async fn install_conversation_subscription(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        generation: u64,
        subscription: FeedSubscription,
    ) {
        let FeedSubscription { id, events } = subscription;
        let pump = self.spawn_conversation_pump(conversation_id, id, events);
        let active = ActiveSubscription::new(id, Some(conversation_id), Arc::clone(&self.feed), pump);

        let mut slot = self.active_subscription.lock().await;
        let current = self.inner.lock().await.stream.is_current(generation);
        if current {
            slot.replace(active);
            debug!(conversation_id = %conversation_id, subscription_id = id.0, "messaging: live updates on");
        } else {
            drop(active);
        }
    }

    fn spawn_conversation_pump(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        subscription_id: SubscriptionId,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(client) = client.upgrade() else {
                    return;
                };
                client.handle_conversation_event(conversation_id, event).await;
            }
            if let Some(client) = client.upgrade() {
                client.conversation_feed_ended(conversation_id, subscription_id).await;
            }
        })
    }

    /// The feed closed the stream (e.g. the connection dropped). The slot is
    /// cleared only if it still holds that subscription.
    async fn conversation_feed_ended(
        &self,
        conversation_id: ConversationId,
        subscription_id: SubscriptionId,
    ) {
        let released = self
            .active_subscription
            .lock()
            .await
            .release_ended(subscription_id);
        if !released {
            debug!(conversation_id = %conversation_id, "messaging: superseded conversation feed ended");
            return;
        }
        warn!(conversation_id = %conversation_id, "messaging: live updates stopped");
        let _ = self.events.send(ClientEvent::Error(format!(
            "live updates for conversation {conversation_id} stopped"
        )));
    }

    async fn handle_conversation_event(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        event: ChangeEvent,
    ) {
        if event.table != Table::Messages || event.kind != ChangeKind::Insert {
            return;
        }
        let message_id = MessageId(event.record_id);
        {
            let guard = self.inner.lock().await;
            if guard.stream.active() != Some(conversation_id) {
                return;
            }
            if guard.stream.contains(message_id) {
                debug!(message_id = %message_id, "messaging: push echo of a displayed message");
                return;
            }
        }

        let message = match self.backend.fetch_message(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!(message_id = %message_id, "messaging: pushed message not found; dropped");
                return;
            }
            Err(err) => {
                warn!(message_id = %message_id, "messaging: pushed message fetch failed; dropped: {err}");
                return;
            }
        };
        if message.conversation_id != conversation_id {
            warn!(message_id = %message_id, "messaging: pushed message belongs to another conversation");
            return;
        }

        let (outcome, viewer) = {
            let mut guard = self.inner.lock().await;
            (guard.stream.append(message.clone()), guard.viewer)
        };
        let AppendOutcome::Inserted { index } = outcome else {
            return;
        };
        let foreign = viewer.is_some_and(|viewer| viewer.user_id != message.sender_id);
        let _ = self
            .events
            .send(ClientEvent::MessageAppended { message, index });

        if foreign {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.mark_read(conversation_id).await });
        }
    }

    pub async fn close_conversation(&self) {
        let closed = self.active_subscription.lock().await.close();
        let mut guard = self.inner.lock().await;
        if let Some(conversation_id) = guard.stream.active() {
            debug!(conversation_id = %conversation_id, closed, "messaging: closing conversation");
        }
        guard.stream.deactivate();
    }

    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message, MessagingError> {
        let viewer = self.require_viewer().await?;
        let draft = NewMessage::text(conversation_id, viewer.user_id, content);
        self.deliver(draft, content).await
    }

    pub async fn send_attachment(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        attachment_url: &str,
        caption: &str,
    ) -> Result<Message, MessagingError> {
        let viewer = self.require_viewer().await?;
        let draft = NewMessage::attachment(conversation_id, viewer.user_id, attachment_url, caption);
        self.deliver(draft, caption).await
    }

    async fn deliver(
        self: &Arc<Self>,
        draft: NewMessage,
        composed: &str,
    ) -> Result<Message, MessagingError> {
        draft
            .validate()
            .map_err(|err| MessagingError::InvalidContent(err.message))?;
        let conversation_id = draft.conversation_id;

        let message = self.backend.insert_message(draft).await.map_err(|source| {
            warn!(conversation_id = %conversation_id, "messaging: send failed: {source}");
            MessagingError::SendFailed {
                draft: composed.to_string(),
                source,
            }
        })?;

        let outcome = self.inner.lock().await.stream.append(message.clone());
        if let AppendOutcome::Inserted { index } = outcome {
            let _ = self.events.send(ClientEvent::MessageAppended {
                message: message.clone(),
                index,
            });
        }
        self.schedule_list_refresh();
        Ok(message)
    }

    /// Marks the counterpart's messages read and zeroes the viewer's unread
    /// counter. Failures are logged only. Calls made while one is running
    /// for the same conversation fold into a single follow-up pass.
    pub async fn mark_read(self: &Arc<Self>, conversation_id: ConversationId) {
        let Some(viewer) = self.viewer().await else {
            return;
        };
        if !self.inner.lock().await.read_tracker.begin(conversation_id) {
            debug!(conversation_id = %conversation_id, "messaging: mark-read already running");
            return;
        }

        // Detached so the in-flight flag is always released even if the
        // caller is cancelled.
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                client.mark_read_pass(conversation_id, viewer).await;
                if !client.inner.lock().await.read_tracker.finish(conversation_id) {
                    break;
                }
            }
        });
        let _ = task.await;
    }

    async fn mark_read_pass(&self, conversation_id: ConversationId, viewer: Viewer) {
        match read_tracker::mark_read_remote(self.backend.as_ref(), conversation_id, viewer).await {
            Ok(marked) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.registry.clear_unread(conversation_id, viewer.role);
                    if guard.stream.active() == Some(conversation_id) {
                        guard.stream.mark_read_from_others(viewer.user_id);
                    }
                }
                debug!(conversation_id = %conversation_id, marked, "messaging: marked conversation read");
                let _ = self.events.send(ClientEvent::ConversationRead {
                    conversation_id,
                    role: viewer.role,
                });
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "messaging: mark-read failed: {err}");
            }
        }
    }

    /// Returns the conversation for the pair, creating it if needed.
    pub async fn start_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Conversation, MessagingError> {
        let conversation = match self.backend.find_conversation(owner_id, driver_id).await? {
            Some(existing) => existing,
            None => match self.backend.insert_conversation(owner_id, driver_id).await {
                Ok(created) => {
                    info!(conversation_id = %created.id, "messaging: started conversation");
                    created
                }
                Err(err) if err.is_conflict() => {
                    debug!(owner_id = %owner_id, driver_id = %driver_id, "messaging: conversation created concurrently");
                    self.backend
                        .find_conversation(owner_id, driver_id)
                        .await?
                        .ok_or_else(|| {
                            MessagingError::Backend(shared::error::ApiException::internal(
                                "conversation conflict reported but no row found",
                            ))
                        })?
                }
                Err(err) => return Err(err.into()),
            },
        };

        let mut guard = self.inner.lock().await;
        if guard
            .viewer
            .is_some_and(|viewer| registry::involves(&viewer, &conversation))
        {
            guard.registry.upsert(conversation.clone());
        }
        Ok(conversation)
    }

    /// Drops the conversation from the local list right away, then deletes
    /// it remotely. An open conversation is closed first.
    pub async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), MessagingError> {
        if self.active_conversation().await == Some(conversation_id) {
            self.close_conversation().await;
        }
        let removed = self.inner.lock().await.registry.remove(conversation_id);
        if removed.is_some() {
            let _ = self
                .events
                .send(ClientEvent::ConversationRemoved(conversation_id));
        }

        self.backend
            .delete_conversation(conversation_id)
            .await
            .map_err(|err| {
                warn!(conversation_id = %conversation_id, "messaging: delete failed: {err}");
                MessagingError::from(err)
            })?;
        info!(conversation_id = %conversation_id, "messaging: deleted conversation");
        Ok(())
    }

    /// Keeps the conversation list live: conversation inserts/updates and
    /// every message insert trigger a refetch. Bursts collapse into one.
    pub async fn watch_conversation_list(self: &Arc<Self>) -> Result<(), MessagingError> {
        self.require_viewer().await?;
        self.unwatch_conversation_list().await;

        let refresh = Arc::new(Notify::new());
        let mut subscriptions = Vec::new();
        for filter in [
            ChangeFilter::conversation_changes(),
            ChangeFilter::all_message_inserts(),
        ] {
            let FeedSubscription { id, mut events } = self
                .feed
                .subscribe(filter)
                .await
                .map_err(MessagingError::Subscription)?;
            let notify = Arc::clone(&refresh);
            let pump = tokio::spawn(async move {
                while events.recv().await.is_some() {
                    notify.notify_one();
                }
            });
            subscriptions.push(ActiveSubscription::new(id, None, Arc::clone(&self.feed), pump));
        }

        let client: Weak<Self> = Arc::downgrade(self);
        let refresher = tokio::spawn(async move {
            loop {
                refresh.notified().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                if let Err(err) = client.list_conversations().await {
                    debug!("messaging: list refresh skipped: {err}");
                }
            }
        });

        *self.list_watch.lock().await = Some(ListWatch::new(subscriptions, refresher));
        debug!("messaging: watching conversation list");
        Ok(())
    }

    pub async fn unwatch_conversation_list(&self) {
        if let Some(watch) = self.list_watch.lock().await.take() {
            debug!(subscriptions = ?watch.subscription_ids(), "messaging: stopped watching conversation list");
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
