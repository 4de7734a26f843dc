use courier_core::{Channel, MessageId, MessageStatus};
use courier_store::StoreError;
use thiserror::Error;

/// What a caller should do after an engine operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; answer upstream with a temporary failure and try again.
    RetryLater,
    /// Permanent for this message or request.
    GiveUp,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no matching process or leg: {0}")]
    Configuration(String),
    #[error("no exchange matches channel {0}")]
    NoMatchingExchange(Channel),
    #[error("store unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("claim for message {0} has expired")]
    ClaimExpired(MessageId),
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
    #[error("message {0} already exists")]
    DuplicateMessage(String),
    #[error("cannot {action} message {message_id} in status {status}")]
    InvalidTransition {
        message_id: MessageId,
        status: MessageStatus,
        action: &'static str,
    },
}

impl EngineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::StoreUnavailable(_) => Disposition::RetryLater,
            Self::Configuration(_)
            | Self::NoMatchingExchange(_)
            | Self::ClaimExpired(_)
            | Self::UnknownMessage(_)
            | Self::DuplicateMessage(_)
            | Self::InvalidTransition { .. } => Disposition::GiveUp,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => Self::DuplicateMessage(id),
            other => Self::StoreUnavailable(other),
        }
    }
}
