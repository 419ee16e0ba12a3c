//! Error types for memtier

use thiserror::Error;
use uuid::Uuid;

/// Main error type for memtier operations
#[derive(Error, Debug, Clone)]
pub enum MemtierError {
    /// Malformed caller input. Surfaced synchronously, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Timeout or rate limit from the storage or intelligence collaborator
    #[error("Transient collaborator error: {0}")]
    TransientCollaborator(String),

    /// Auth failure, shape mismatch or any other non-recoverable collaborator error
    #[error("Permanent collaborator error: {0}")]
    PermanentCollaborator(String),

    /// Persisted data that breaks an invariant (missing or impossible timestamps, bad scores)
    #[error("Consistency violation on {item_id}: {reason}")]
    ConsistencyViolation { item_id: Uuid, reason: String },

    /// Two mutations contended for the same item lock
    #[error("Concurrency conflict on item {0}")]
    ConcurrencyConflict(Uuid),

    /// Item or job lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors (snapshot files, index bookkeeping)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The engine or scheduler has been shut down
    #[error("Shutting down")]
    Shutdown,
}

impl MemtierError {
    /// Whether a job failing with this error should be retried after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemtierError::TransientCollaborator(_) | MemtierError::ConcurrencyConflict(_)
        )
    }

    /// Whether this error should send a job straight to the dead-letter queue
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    pub fn consistency(item_id: Uuid, reason: impl Into<String>) -> Self {
        MemtierError::ConsistencyViolation {
            item_id,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for MemtierError {
    fn from(e: std::io::Error) -> Self {
        MemtierError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MemtierError {
    fn from(e: serde_json::Error) -> Self {
        MemtierError::Serialization(e.to_string())
    }
}

/// Result type alias for memtier operations
pub type Result<T> = std::result::Result<T, MemtierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MemtierError::TransientCollaborator("timeout".into()).is_retryable());
        assert!(MemtierError::ConcurrencyConflict(Uuid::new_v4()).is_retryable());

        assert!(MemtierError::PermanentCollaborator("401".into()).is_permanent());
        assert!(MemtierError::Validation("empty".into()).is_permanent());
        assert!(MemtierError::consistency(Uuid::nil(), "future timestamp").is_permanent());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MemtierError = io.into();
        assert!(matches!(err, MemtierError::Io(_)));
    }
}
