use crate::events::ErrorNotice;
use crate::traits::StoreError;

/// Failures the relay reports back to the connection that caused them.
///
/// The display string of each variant is the user-facing message sent in the
/// `error` event; any underlying detail travels separately.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    /// A required payload field is absent or has the wrong shape.
    #[error("{0}")]
    MissingField(String),
    /// The referenced conversation or position does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The actor is not allowed to touch the conversation.
    #[error("{0}")]
    Forbidden(String),
    /// The persistence gateway call itself failed.
    #[error("{context}")]
    PersistenceFailure { context: String, detail: String },
    /// Connection-level failure, handled by reconnection.
    #[error("Transport error: {0}")]
    TransportFailure(String),
}

impl RelayError {
    pub fn missing(field: &str) -> Self {
        RelayError::MissingField(format!("Missing {}", field))
    }

    pub fn conversation_not_found() -> Self {
        RelayError::NotFound("Conversation not found".to_string())
    }

    pub fn access_denied() -> Self {
        RelayError::Forbidden("Access denied to this conversation".to_string())
    }

    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        RelayError::PersistenceFailure {
            context: context.to_string(),
            detail: err.to_string(),
        }
    }

    /// Wire payload for the scoped `error` event.
    pub fn to_notice(&self) -> ErrorNotice {
        let error = match self {
            RelayError::PersistenceFailure { detail, .. } => Some(detail.clone()),
            _ => None,
        };
        ErrorNotice {
            message: self.to_string(),
            error,
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        RelayError::persistence("Database error", err)
    }
}
