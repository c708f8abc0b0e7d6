use shared::{
    domain::{ConversationId, Role, Viewer},
    error::{ApiError, ApiException},
    protocol::Conversation,
};
use tracing::debug;

use crate::{
    backend::{ConversationScope, DataService},
    error::MessagingError,
};

/// Cached conversation list for the signed-in user.
///
/// Refreshes are numbered when they start; a result is applied only if no
/// later-started refresh has already landed, so a slow response can never
/// overwrite a newer one. Badges zeroed locally are re-applied to any
/// result whose refresh started before the zeroing.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: Vec<Conversation>,
    last_error: Option<ApiError>,
    issued_generation: u64,
    applied_generation: u64,
    // (conversation, role, last generation issued when it was cleared)
    cleared: Vec<(ConversationId, Role, u64)>,
}

impl ConversationRegistry {
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    pub fn begin_refresh(&mut self) -> u64 {
        self.issued_generation += 1;
        self.issued_generation
    }

    /// Returns false when the result was superseded and discarded.
    /// A failed fetch keeps the cached list and records the error.
    pub fn apply_refresh(
        &mut self,
        generation: u64,
        result: Result<Vec<Conversation>, ApiException>,
    ) -> bool {
        if generation <= self.applied_generation {
            debug!(generation, applied = self.applied_generation, "registry: discarding stale refresh");
            return false;
        }
        self.applied_generation = generation;
        match result {
            Ok(mut conversations) => {
                for (conversation_id, role, cleared_at) in &self.cleared {
                    if *cleared_at < generation {
                        continue;
                    }
                    if let Some(conversation) =
                        conversations.iter_mut().find(|c| c.id == *conversation_id)
                    {
                        conversation.clear_unread(*role);
                    }
                }
                self.cleared.retain(|(_, _, cleared_at)| *cleared_at > generation);
                sort_conversations(&mut conversations);
                self.conversations = conversations;
                self.last_error = None;
            }
            Err(err) => self.last_error = Some(err.into()),
        }
        true
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|existing| existing.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        sort_conversations(&mut self.conversations);
    }

    pub fn remove(&mut self, conversation_id: ConversationId) -> Option<Conversation> {
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == conversation_id)?;
        Some(self.conversations.remove(index))
    }

    pub fn clear_unread(&mut self, conversation_id: ConversationId, role: Role) -> bool {
        if self.issued_generation > self.applied_generation {
            self.cleared
                .push((conversation_id, role, self.issued_generation));
        }
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            Some(conversation) => {
                conversation.clear_unread(role);
                true
            }
            None => false,
        }
    }

    pub fn total_unread(&self, role: Role) -> u32 {
        self.conversations.iter().map(|c| c.unread_for(role)).sum()
    }

    pub fn reset(&mut self) {
        self.conversations.clear();
        self.last_error = None;
        self.cleared.clear();
        // Outstanding refreshes from the previous session must not land.
        self.applied_generation = self.issued_generation;
    }
}

/// Newest activity first; conversations without messages last.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn involves(viewer: &Viewer, conversation: &Conversation) -> bool {
    match viewer.role {
        Role::Owner => conversation.owner_id == viewer.user_id,
        Role::Driver => viewer.driver_profile_id == Some(conversation.driver_id),
    }
}

/// Resolves which conversations `viewer` sees. Drivers without a cached
/// profile id are looked up; the resolved viewer is returned for caching.
pub(crate) async fn resolve_scope(
    backend: &dyn DataService,
    viewer: Viewer,
) -> Result<(ConversationScope, Viewer), MessagingError> {
    match viewer.role {
        Role::Owner => Ok((ConversationScope::Owner(viewer.user_id), viewer)),
        Role::Driver => {
            let driver_profile_id = match viewer.driver_profile_id {
                Some(id) => id,
                None => backend
                    .driver_profile_for_user(viewer.user_id)
                    .await?
                    .ok_or(MessagingError::MissingDriverProfile(viewer.user_id))?,
            };
            Ok((
                ConversationScope::Driver(driver_profile_id),
                Viewer::driver(viewer.user_id, Some(driver_profile_id)),
            ))
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
