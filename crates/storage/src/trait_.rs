//! Storage trait abstraction.

use async_trait::async_trait;
use orca_core::{
    AuditEvent, LockRecord, LockToken, RerouteEvent, RouteDecision, TaskId, WorkFilter, WorkItem,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A versioned write lost to a concurrent writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result of a compare-and-set on a lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write happened; this is the stored record
    Applied(LockRecord),
    /// The expected version did not match; this is what is stored now
    Conflict(Option<LockRecord>),
}

impl CasOutcome {
    /// True if the write happened.
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Storage abstraction for Orca state.
///
/// Implementations must make `compare_and_set_lock` atomic per resource key:
/// it is the serialization point for every lease operation.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Lock records ===

    /// Load the record for a resource key.
    async fn get_lock(&self, resource_key: &str) -> Result<Option<LockRecord>>;

    /// Replace the token of `resource_key` if its version is `expected_version`.
    ///
    /// `None` as the expected version means "no record exists yet". On
    /// success the stored version becomes `expected_version + 1` (or 1).
    async fn compare_and_set_lock(
        &self,
        resource_key: &str,
        expected_version: Option<u64>,
        new: Option<LockToken>,
    ) -> Result<CasOutcome>;

    /// All lock records, ordered by resource key.
    async fn list_locks(&self) -> Result<Vec<LockRecord>>;

    // === Routing decisions ===

    /// Append a decision to the task's history.
    async fn append_decision(&self, decision: &RouteDecision) -> Result<()>;

    /// All decisions for a task, oldest first.
    async fn list_decisions(&self, task_id: TaskId) -> Result<Vec<RouteDecision>>;

    /// Append a reroute event.
    async fn append_reroute(&self, event: &RerouteEvent) -> Result<()>;

    /// All reroutes of a task, oldest first.
    async fn list_reroutes(&self, task_id: TaskId) -> Result<Vec<RerouteEvent>>;

    /// Most recent decision for a task.
    async fn latest_decision(&self, task_id: TaskId) -> Result<Option<RouteDecision>> {
        Ok(self.list_decisions(task_id).await?.pop())
    }

    // === Work items ===

    /// Save a work item if the stored version still equals `item.version`.
    ///
    /// A missing item counts as version 0. Returns the new stored version;
    /// callers write it back into their copy before saving again. A stale
    /// copy fails with [`StorageError::Conflict`].
    async fn save_work_item(&self, item: &WorkItem) -> Result<u64>;

    /// Load a work item by task ID.
    async fn load_work_item(&self, task_id: TaskId) -> Result<Option<WorkItem>>;

    /// List work items matching the filter.
    async fn list_work_items(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>>;

    // === Audit ===

    /// Append an audit event.
    async fn append_audit(&self, event: &AuditEvent) -> Result<()>;

    /// All audit events, oldest first.
    async fn list_audit(&self) -> Result<Vec<AuditEvent>>;
}

impl StorageError {
    /// Whether this is a lost compare-and-set on a work item.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Reject a work item save whose base version is stale.
pub(crate) fn check_item_version(item: &WorkItem, stored: Option<u64>) -> Result<u64> {
    let stored = stored.unwrap_or(0);
    if stored != item.version {
        return Err(StorageError::Conflict(format!(
            "work item {} is at version {}, write was based on {}",
            item.task_id, stored, item.version
        )));
    }
    Ok(stored + 1)
}

/// Next record for a compare-and-set that has passed its version check.
pub(crate) fn next_record(resource_key: &str, current_version: Option<u64>, new: Option<LockToken>) -> LockRecord {
    LockRecord {
        resource_key: resource_key.to_string(),
        current: new,
        version: current_version.map_or(1, |v| v + 1),
    }
}
