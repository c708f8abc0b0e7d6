//! Seams to the remote data service: request/response queries and the
//! row-change push feed.

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, DriverProfileId, MessageId, Role, UserId},
    error::ApiException,
    protocol::{ChangeEvent, ChangeFilter, Conversation, Message, NewMessage, SubscriptionId},
};
use tokio::sync::mpsc;

pub mod local;
pub mod realtime;
pub mod rest;

pub use local::LocalBackend;
pub use realtime::RealtimeFeed;
pub use rest::{RestConfig, RestDataService};

/// Which conversations a list query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationScope {
    Owner(UserId),
    Driver(DriverProfileId),
}

#[async_trait]
pub trait DataService: Send + Sync {
    /// Conversations with participant fields and the newest message embedded.
    async fn list_conversations(
        &self,
        scope: ConversationScope,
    ) -> Result<Vec<Conversation>, ApiException>;
    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, ApiException>;
    async fn find_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Option<Conversation>, ApiException>;
    /// Must fail with `ErrorCode::Conflict` when the pair already exists.
    async fn insert_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Conversation, ApiException>;
    async fn delete_conversation(&self, conversation_id: ConversationId)
        -> Result<(), ApiException>;
    /// The newest `limit` messages, oldest first, with sender fields embedded.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiException>;
    async fn fetch_message(&self, message_id: MessageId) -> Result<Option<Message>, ApiException>;
    async fn insert_message(&self, message: NewMessage) -> Result<Message, ApiException>;
    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, ApiException>;
    async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        role: Role,
    ) -> Result<(), ApiException>;
    async fn driver_profile_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DriverProfileId>, ApiException>;
}

/// A live feed subscription. Events stop when the feed drops the sender.
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription, ApiException>;
    /// Must not block; called from drop paths.
    fn unsubscribe(&self, subscription_id: SubscriptionId);
}

pub struct MissingChangeFeed;

#[async_trait]
impl ChangeFeed for MissingChangeFeed {
    async fn subscribe(&self, _filter: ChangeFilter) -> Result<FeedSubscription, ApiException> {
        Err(ApiException::unavailable("change feed is unavailable"))
    }

    fn unsubscribe(&self, _subscription_id: SubscriptionId) {}
}
