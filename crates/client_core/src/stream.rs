use std::collections::HashSet;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::Message,
};

pub const MAX_MESSAGE_WINDOW: u32 = 100;

pub fn clamp_window(window: u32) -> u32 {
    window.clamp(1, MAX_MESSAGE_WINDOW)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { index: usize },
    Duplicate,
    /// The message belongs to a conversation other than the active one.
    Inactive,
}

/// Message list of the active conversation, kept sorted by
/// `(created_at, id)` with no repeated ids.
#[derive(Debug, Default)]
pub struct MessageStream {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    generation: u64,
}

impl MessageStream {
    /// Switches to `conversation_id` with an empty list. The returned
    /// generation identifies this activation for `replace`.
    pub fn activate(&mut self, conversation_id: ConversationId) -> u64 {
        self.conversation_id = Some(conversation_id);
        self.messages.clear();
        self.ids.clear();
        self.generation += 1;
        self.generation
    }

    pub fn deactivate(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
        self.ids.clear();
        self.generation += 1;
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.conversation_id.is_some() && self.generation == generation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.ids.contains(&message_id)
    }

    /// Installs a fetched window. Messages already appended that are newer
    /// than the window's oldest entry are kept. Returns false if the
    /// activation changed since `generation` was issued.
    pub fn replace(&mut self, generation: u64, fetched: Vec<Message>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        let previous = std::mem::take(&mut self.messages);
        self.ids.clear();
        for message in fetched {
            self.append(message);
        }
        let oldest = self.messages.first().map(Message::order_key);
        for message in previous {
            if oldest.map_or(true, |oldest| message.order_key() > oldest) {
                self.append(message);
            }
        }
        true
    }

    pub fn append(&mut self, message: Message) -> AppendOutcome {
        if Some(message.conversation_id) != self.conversation_id {
            return AppendOutcome::Inactive;
        }
        if !self.ids.insert(message.id) {
            return AppendOutcome::Duplicate;
        }
        let key = message.order_key();
        let index = self.messages.partition_point(|m| m.order_key() < key);
        self.messages.insert(index, message);
        AppendOutcome::Inserted { index }
    }

    /// Flags every message not sent by `reader` as read. Returns how many changed.
    pub fn mark_read_from_others(&mut self, reader: UserId) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut() {
            if message.sender_id != reader && !message.is_read {
                message.is_read = true;
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
