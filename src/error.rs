//! Typed errors for the coordination layer.
//!
//! Per-file pipeline failures travel as `anyhow` errors attached to the file
//! that produced them; the coordination layer (locks, operation queue,
//! admission control) needs a closed error type so retry policies can
//! classify failures as retryable or terminal.

use std::time::Duration;

use crate::coordinate::IndexType;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("timed out acquiring {mode} lock on {index:?} after {waited:?}")]
    LockTimeout {
        index: IndexType,
        mode: LockMode,
        waited: Duration,
    },

    #[error("operation queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("operation {id} is already queued")]
    DuplicateOperation { id: u64 },

    #[error("operation {id} not found")]
    OperationNotFound { id: u64 },

    #[error("concurrent operation limit reached ({active}/{limit}), try later")]
    GlobalCapExceeded { active: usize, limit: usize },

    #[error("per-index operation limit reached for {index:?} ({limit}), try later")]
    IndexCapExceeded { index: IndexType, limit: usize },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("indexing deferred: memory usage above configured threshold")]
    IndexingDeferred,

    #[error("indexing temporarily suspended: memory usage above configured threshold")]
    SearchSuspended,

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

impl CoordinationError {
    /// Whether the lock manager or queue processor should retry after this
    /// error. Timeouts and transient "busy" conditions are retryable;
    /// invalid/not-found and cap conditions are surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::LockTimeout { .. }
                | CoordinationError::QueueFull { .. }
                | CoordinationError::OperationFailed(_)
        )
    }
}
