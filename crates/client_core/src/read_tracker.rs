use std::collections::HashSet;

use shared::{
    domain::{ConversationId, Viewer},
    error::ApiException,
};

use crate::backend::DataService;

/// Coalesces mark-read calls: at most one runs per conversation, and calls
/// arriving meanwhile collapse into a single follow-up pass.
#[derive(Debug, Default)]
pub struct ReadTracker {
    inflight: HashSet<ConversationId>,
    rerun: HashSet<ConversationId>,
}

impl ReadTracker {
    /// Returns false when a pass is already running; that pass will repeat once.
    pub fn begin(&mut self, conversation_id: ConversationId) -> bool {
        if self.inflight.insert(conversation_id) {
            true
        } else {
            self.rerun.insert(conversation_id);
            false
        }
    }

    /// Returns true when the caller must run another pass.
    pub fn finish(&mut self, conversation_id: ConversationId) -> bool {
        if self.rerun.remove(&conversation_id) {
            return true;
        }
        self.inflight.remove(&conversation_id);
        false
    }

    pub fn is_inflight(&self, conversation_id: ConversationId) -> bool {
        self.inflight.contains(&conversation_id)
    }
}

/// Marks the counterpart's messages read, then zeroes the viewer's unread
/// counter. Returns the number of messages flagged.
pub(crate) async fn mark_read_remote(
    backend: &dyn DataService,
    conversation_id: ConversationId,
    viewer: Viewer,
) -> Result<u64, ApiException> {
    let marked = backend
        .mark_messages_read(conversation_id, viewer.user_id)
        .await?;
    backend.reset_unread(conversation_id, viewer.role).await?;
    Ok(marked)
}
