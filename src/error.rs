//! Crate-wide error type for manager operations

use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur while running managers
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Another holder owns the lock. Expected under contention; the cycle is skipped.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// A held lease could not be renewed because another holder took it over.
    #[error("Lock lost: {0}")]
    LockLost(String),

    /// A task body or stream handler failed.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// A storage or search collaborator could not be reached.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Internal bookkeeping is inconsistent. This is a bug, not a runtime condition.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ManagerError {
    /// True for the expected "someone else is running this" outcome
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Self::LockUnavailable(_))
    }
}

impl From<serde_yaml::Error> for ManagerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;
