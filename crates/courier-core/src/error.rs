use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid caller input or malformed primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Persisted status string that does not name a known status.
    #[error("unknown message status: {0}")]
    UnknownStatus(String),
    /// Persisted direction string that is neither push nor pull.
    #[error("unknown exchange direction: {0}")]
    UnknownDirection(String),
}
