//! Event store error types

use thiserror::Error;

/// Errors that can occur during event store operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Failed to connect to the store backend
    #[error("Store connection error: {0}")]
    ConnectionError(String),

    /// An operation was attempted before `connect` or after `close`
    #[error("Store is not connected")]
    NotConnected,

    /// Store operation exceeded its operation-level timeout
    #[error("Store operation timed out: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Server-side script failed or is unsupported
    #[error("Store script error: {0}")]
    ScriptError(String),

    /// Generic backend error
    #[error("Store backend error: {operation}: {message}")]
    BackendError { operation: String, message: String },

    /// Reply could not be interpreted as the expected shape
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// Some commands of a non-atomic pipeline failed
    #[error("Pipeline partially applied: {failed} of {total} commands failed")]
    PartialWrite { failed: usize, total: usize },
}

impl StoreError {
    /// Create a backend error
    pub fn backend(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::BackendError {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the store itself was unreachable (as opposed to a bad reply)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::NotConnected | Self::Timeout { .. }
        )
    }
}

/// Result type for event store operations
pub type StoreResult<T> = Result<T, StoreError>;
