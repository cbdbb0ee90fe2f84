//! Lease errors.

use orca_core::LockId;
use orca_storage::StorageError;
use std::time::Duration;

/// Result alias for lease operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors returned by the lock manager.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live holder owns the resource.
    ///
    /// `wait` tells the caller whether backing off and retrying is worthwhile
    /// (the current lease ends within the configured horizon) or whether it
    /// should fail fast.
    #[error("{resource} is held by {current_owner} (wait: {wait})")]
    Conflict {
        /// Contended resource
        resource: String,
        /// Holder of the live lease
        current_owner: String,
        /// Whether retrying is worthwhile
        wait: bool,
        /// Time until the live lease expires
        retry_after: Duration,
    },

    /// The token's lease was reclaimed or has expired; the work is lost.
    #[error("lease {lock_id} on {resource} expired or was reclaimed")]
    ExpiredElsewhere {
        /// Resource of the lost lease
        resource: String,
        /// The lost grant
        lock_id: LockId,
    },

    /// Zero or over-long TTL.
    #[error("invalid ttl {ttl:?}: {reason}")]
    InvalidTtl {
        /// Requested TTL
        ttl: Duration,
        /// Why it was rejected
        reason: String,
    },

    /// The record kept changing under us.
    #[error("gave up on {resource} after {attempts} contended writes")]
    Contention {
        /// Contended resource
        resource: String,
        /// Compare-and-set attempts made
        attempts: u32,
    },

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LockError {
    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            LockError::Conflict { wait, .. } => *wait,
            LockError::Contention { .. } | LockError::Storage(_) => true,
            LockError::ExpiredElsewhere { .. } | LockError::InvalidTtl { .. } => false,
        }
    }
}
