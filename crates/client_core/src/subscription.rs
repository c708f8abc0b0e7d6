use std::sync::Arc;

use shared::{domain::ConversationId, protocol::SubscriptionId};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::ChangeFeed;

/// A live feed subscription plus the task draining it. Dropping it stops
/// the task and unsubscribes from the feed.
pub struct ActiveSubscription {
    id: SubscriptionId,
    conversation_id: Option<ConversationId>,
    feed: Arc<dyn ChangeFeed>,
    pump: JoinHandle<()>,
}

impl ActiveSubscription {
    pub fn new(
        id: SubscriptionId,
        conversation_id: Option<ConversationId>,
        feed: Arc<dyn ChangeFeed>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            feed,
            pump,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.pump.abort();
        self.feed.unsubscribe(self.id);
        debug!(
            subscription_id = self.id.0,
            conversation_id = ?self.conversation_id,
            "sync: closed subscription"
        );
    }
}

/// Holds at most one subscription.
#[derive(Default)]
pub struct SubscriptionSlot {
    active: Option<ActiveSubscription>,
}

impl SubscriptionSlot {
    /// Tears down the current subscription before installing `next`.
    pub fn replace(&mut self, next: ActiveSubscription) {
        self.close();
        self.active = Some(next);
    }

    /// Returns whether a subscription was open.
    pub fn close(&mut self) -> bool {
        self.active.take().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Drops the held subscription if it is `id`, whose stream has already
    /// ended. Called from that subscription's own pump, which must not
    /// await afterwards.
    pub fn release_ended(&mut self, id: SubscriptionId) -> bool {
        if self.active.as_ref().map(ActiveSubscription::id) != Some(id) {
            return false;
        }
        self.close()
    }
}

/// Subscriptions backing the live conversation list, plus the task that
/// coalesces their events into refetches.
pub struct ListWatch {
    subscriptions: Vec<ActiveSubscription>,
    refresher: JoinHandle<()>,
}

impl ListWatch {
    pub fn new(subscriptions: Vec<ActiveSubscription>, refresher: JoinHandle<()>) -> Self {
        Self {
            subscriptions,
            refresher,
        }
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.iter().map(ActiveSubscription::id).collect()
    }
}

impl Drop for ListWatch {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}
