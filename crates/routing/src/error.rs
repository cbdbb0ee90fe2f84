//! Routing errors.

use crate::registry::RegistryError;
use orca_core::{InvalidTransition, TaskId};
use orca_lock::LockError;
use orca_storage::StorageError;
use std::collections::BTreeMap;

/// Result alias for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors returned by the router.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// Every candidate was rejected; `rejections` lists why, per instance.
    #[error("no eligible instance for task {task_id} ({} candidates rejected)", rejections.len())]
    NoEligibleInstance {
        /// Task that could not be routed
        task_id: TaskId,
        /// instance id -> rejection reasons
        rejections: BTreeMap<String, Vec<String>>,
    },

    /// The task has no decision to reroute or dispatch from.
    #[error("task {0} has not been routed")]
    NotRouted(TaskId),

    /// The work item is not in a state that allows the operation.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A capability constraint could not be parsed.
    #[error("invalid requirement for {capability}: {reason}")]
    InvalidRequirement {
        /// Capability name
        capability: String,
        /// Parse failure
        reason: String,
    },

    /// Taking the execution lease failed
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Instance registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
