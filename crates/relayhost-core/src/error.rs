//! RelayHost error types.

use thiserror::Error;

/// Errors raised by the relay pipeline and its storage collaborators.
///
/// Lease contention and function failure are not errors: they travel as
/// [`crate::LeaseOutcome::AlreadyLeased`] and [`crate::FunctionResult::Failed`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// Timeout, throttling or temporary unavailability. Always retried.
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue message '{0}' not found")]
    MessageNotFound(String),

    #[error("Pop receipt for message '{0}' is no longer valid")]
    PopReceiptMismatch(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid blob path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Listener has been disposed")]
    Disposed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether the failure should be retried with backoff rather than reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
