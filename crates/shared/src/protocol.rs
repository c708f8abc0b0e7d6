use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, DriverProfileId, MessageId, MessageType, Role, UserId},
    error::{ApiError, ApiException, ErrorCode},
};

pub const MAX_MESSAGE_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Denormalized copy of a conversation's newest message, used for list previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub content: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner_id: UserId,
    pub driver_id: DriverProfileId,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_unread_count: u32,
    #[serde(default)]
    pub driver_unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ParticipantSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<ParticipantSummary>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn unread_for(&self, role: Role) -> u32 {
        match role {
            Role::Owner => self.owner_unread_count,
            Role::Driver => self.driver_unread_count,
        }
    }

    pub fn clear_unread(&mut self, role: Role) {
        match role {
            Role::Owner => self.owner_unread_count = 0,
            Role::Driver => self.driver_unread_count = 0,
        }
    }

    /// The participant on the other side from `role`.
    pub fn counterpart(&self, role: Role) -> Option<&ParticipantSummary> {
        match role {
            Role::Owner => self.driver.as_ref(),
            Role::Driver => self.owner.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ParticipantSummary>,
}

impl Message {
    /// Display order within a conversation: creation time, then id.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

impl NewMessage {
    pub fn text(conversation_id: ConversationId, sender_id: UserId, content: &str) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: content.trim().to_string(),
            message_type: MessageType::Text,
            attachment_url: None,
        }
    }

    pub fn attachment(
        conversation_id: ConversationId,
        sender_id: UserId,
        attachment_url: &str,
        caption: &str,
    ) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: caption.trim().to_string(),
            message_type: MessageType::Attachment,
            attachment_url: Some(attachment_url.trim().to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ApiException> {
        let chars = self.content.chars().count();
        if chars > MAX_MESSAGE_CONTENT_CHARS {
            return Err(ApiException::new(
                ErrorCode::Validation,
                format!("message content exceeds {MAX_MESSAGE_CONTENT_CHARS} characters ({chars})"),
            ));
        }
        match self.message_type {
            MessageType::Text if self.content.trim().is_empty() => Err(ApiException::new(
                ErrorCode::Validation,
                "message content must not be empty",
            )),
            MessageType::Attachment
                if self
                    .attachment_url
                    .as_deref()
                    .map_or(true, |url| url.trim().is_empty()) =>
            {
                Err(ApiException::new(
                    ErrorCode::Validation,
                    "attachment messages require an attachment url",
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification from the push feed.
///
/// Only identifies the row; subscribers fetch whatever else they need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl ChangeEvent {
    pub fn message_inserted(message_id: MessageId, conversation_id: ConversationId) -> Self {
        Self {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record_id: message_id.0,
            conversation_id: Some(conversation_id),
        }
    }

    pub fn conversation_changed(kind: ChangeKind, conversation_id: ConversationId) -> Self {
        Self {
            table: Table::Conversations,
            kind,
            record_id: conversation_id.0,
            conversation_id: Some(conversation_id),
        }
    }
}

/// Table + event kinds + optional equality predicate on `conversation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: Table,
    pub kinds: Vec<ChangeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl ChangeFilter {
    pub fn messages_in(conversation_id: ConversationId) -> Self {
        Self {
            table: Table::Messages,
            kinds: vec![ChangeKind::Insert],
            conversation_id: Some(conversation_id),
        }
    }

    pub fn all_message_inserts() -> Self {
        Self {
            table: Table::Messages,
            kinds: vec![ChangeKind::Insert],
            conversation_id: None,
        }
    }

    pub fn conversation_changes() -> Self {
        Self {
            table: Table::Conversations,
            kinds: vec![ChangeKind::Insert, ChangeKind::Update],
            conversation_id: None,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.kinds.contains(&event.kind) {
            return false;
        }
        match self.conversation_id {
            Some(expected) => event.conversation_id == Some(expected),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

/// Frames exchanged with the realtime change feed over a websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedFrame {
    Subscribe {
        subscription_id: SubscriptionId,
        filter: ChangeFilter,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Subscribed {
        subscription_id: SubscriptionId,
    },
    Change {
        subscription_id: SubscriptionId,
        event: ChangeEvent,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
        error: ApiError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_filter_only_matches_its_conversation() {
        let target = ConversationId::random();
        let other = ConversationId::random();
        let filter = ChangeFilter::messages_in(target);

        assert!(filter.matches(&ChangeEvent::message_inserted(MessageId::random(), target)));
        assert!(!filter.matches(&ChangeEvent::message_inserted(MessageId::random(), other)));
        assert!(!filter.matches(&ChangeEvent::conversation_changed(
            ChangeKind::Update,
            target
        )));
    }

    #[test]
    fn conversation_filter_ignores_deletes() {
        let filter = ChangeFilter::conversation_changes();
        let id = ConversationId::random();
        assert!(filter.matches(&ChangeEvent::conversation_changed(ChangeKind::Insert, id)));
        assert!(filter.matches(&ChangeEvent::conversation_changed(ChangeKind::Update, id)));
        assert!(!filter.matches(&ChangeEvent::conversation_changed(ChangeKind::Delete, id)));
    }

    #[test]
    fn rejects_blank_and_oversized_text() {
        let conversation = ConversationId::random();
        let sender = UserId::random();

        let blank = NewMessage::text(conversation, sender, "   ");
        assert_eq!(blank.validate().expect_err("blank").code, ErrorCode::Validation);

        let long = "x".repeat(MAX_MESSAGE_CONTENT_CHARS + 1);
        let oversized = NewMessage::text(conversation, sender, &long);
        assert_eq!(
            oversized.validate().expect_err("too long").code,
            ErrorCode::Validation
        );

        let ok = NewMessage::text(conversation, sender, "  Hello ");
        ok.validate().expect("valid");
        assert_eq!(ok.content, "Hello");
    }

    #[test]
    fn attachment_requires_url_but_not_caption() {
        let conversation = ConversationId::random();
        let sender = UserId::random();

        let missing = NewMessage::attachment(conversation, sender, " ", "licence scan");
        assert!(missing.validate().is_err());

        let captionless =
            NewMessage::attachment(conversation, sender, "https://files.example/doc.pdf", "");
        captionless.validate().expect("valid attachment");
    }

    #[test]
    fn feed_frames_use_tagged_wire_shape() {
        let frame = FeedFrame::Unsubscribe {
            subscription_id: SubscriptionId(4),
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "unsubscribe");
        assert_eq!(json["payload"]["subscription_id"], 4);
    }
}
