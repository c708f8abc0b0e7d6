//! In-process backend over the SQLite store. Used by the CLI's `local`
//! mode and by the facade tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ConversationId, DriverProfileId, MessageId, Role, UserId},
    error::{ApiException, ErrorCode},
    protocol::{ChangeFilter, Conversation, Message, NewMessage, SubscriptionId},
};
use storage::Storage;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use super::{ChangeFeed, ConversationScope, DataService, FeedSubscription};

pub struct LocalBackend {
    storage: Storage,
    next_subscription_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            next_subscription_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of feed subscriptions that have not been unsubscribed.
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    }
}

fn map_storage_error(err: anyhow::Error) -> ApiException {
    if let Some(api) = err.downcast_ref::<ApiException>() {
        return api.clone();
    }
    if storage::is_unique_violation(&err) {
        return ApiException::new(ErrorCode::Conflict, "row already exists");
    }
    if storage::is_foreign_key_violation(&err) {
        return ApiException::not_found("referenced row does not exist");
    }
    ApiException::internal(format!("{err:#}"))
}

#[async_trait]
impl DataService for LocalBackend {
    async fn list_conversations(
        &self,
        scope: ConversationScope,
    ) -> Result<Vec<Conversation>, ApiException> {
        match scope {
            ConversationScope::Owner(owner_id) => {
                self.storage.list_conversations_for_owner(owner_id).await
            }
            ConversationScope::Driver(driver_id) => {
                self.storage.list_conversations_for_driver(driver_id).await
            }
        }
        .map_err(map_storage_error)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, ApiException> {
        self.storage
            .conversation(conversation_id)
            .await
            .map_err(map_storage_error)
    }

    async fn find_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Option<Conversation>, ApiException> {
        self.storage
            .find_conversation(owner_id, driver_id)
            .await
            .map_err(map_storage_error)
    }

    async fn insert_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Conversation, ApiException> {
        self.storage
            .insert_conversation(owner_id, driver_id)
            .await
            .map_err(map_storage_error)
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ApiException> {
        let deleted = self
            .storage
            .delete_conversation(conversation_id)
            .await
            .map_err(map_storage_error)?;
        if !deleted {
            debug!(conversation_id = %conversation_id, "local: delete matched no conversation");
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiException> {
        self.storage
            .recent_messages(conversation_id, limit)
            .await
            .map_err(map_storage_error)
    }

    async fn fetch_message(&self, message_id: MessageId) -> Result<Option<Message>, ApiException> {
        self.storage
            .message(message_id)
            .await
            .map_err(map_storage_error)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, ApiException> {
        self.storage
            .insert_message(&message)
            .await
            .map_err(map_storage_error)
    }

    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, ApiException> {
        self.storage
            .mark_messages_read(conversation_id, reader)
            .await
            .map_err(map_storage_error)
    }

    async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        role: Role,
    ) -> Result<(), ApiException> {
        let updated = self
            .storage
            .reset_unread(conversation_id, role)
            .await
            .map_err(map_storage_error)?;
        if updated {
            Ok(())
        } else {
            Err(ApiException::not_found(format!(
                "conversation {conversation_id} not found"
            )))
        }
    }

    async fn driver_profile_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DriverProfileId>, ApiException> {
        self.storage
            .driver_profile_for_user(user_id)
            .await
            .map_err(map_storage_error)
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription, ApiException> {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        // Take the receiver before returning so no change published after
        // `subscribe` resolves can be missed.
        let mut changes = BroadcastStream::new(self.storage.subscribe_changes());
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(item) = changes.next().await {
                match item {
                    Ok(event) if filter.matches(&event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(subscription_id = id.0, skipped, "local: change feed lagged");
                    }
                }
            }
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, task);
        debug!(subscription_id = id.0, "local: subscribed to change feed");
        Ok(FeedSubscription { id, events: rx })
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&subscription_id);
        if let Some(task) = task {
            task.abort();
            debug!(subscription_id = subscription_id.0, "local: unsubscribed from change feed");
        }
    }
}
