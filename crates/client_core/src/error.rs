use shared::{
    domain::{ConversationId, UserId},
    error::{ApiException, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("user {0} has no driver profile")]
    MissingDriverProfile(UserId),
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("invalid message: {0}")]
    InvalidContent(String),
    /// The composed text is handed back so the caller can restore it.
    #[error("failed to send message: {source}")]
    SendFailed {
        draft: String,
        #[source]
        source: ApiException,
    },
    #[error("failed to open change feed subscription: {0}")]
    Subscription(#[source] ApiException),
    #[error(transparent)]
    Backend(#[from] ApiException),
}

impl MessagingError {
    pub fn draft(&self) -> Option<&str> {
        match self {
            MessagingError::SendFailed { draft, .. } => Some(draft),
            _ => None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            MessagingError::NotSignedIn => ErrorCode::Unauthorized,
            MessagingError::MissingDriverProfile(_) | MessagingError::ConversationNotFound(_) => {
                ErrorCode::NotFound
            }
            MessagingError::InvalidContent(_) => ErrorCode::Validation,
            MessagingError::SendFailed { source, .. }
            | MessagingError::Subscription(source)
            | MessagingError::Backend(source) => source.code,
        }
    }
}
