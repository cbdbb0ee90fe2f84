//! In-process storage.
//!
//! Everything lives behind one async mutex, which makes every operation
//! (compare-and-set included) trivially atomic. Used by tests and by
//! single-process deployments that do not need durability.

use super::trait_::{check_item_version, next_record, CasOutcome, Result, Storage};
use async_trait::async_trait;
use orca_core::{
    AuditEvent, LockRecord, LockToken, RerouteEvent, RouteDecision, TaskId, WorkFilter, WorkItem,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    locks: BTreeMap<String, LockRecord>,
    decisions: Vec<RouteDecision>,
    reroutes: Vec<RerouteEvent>,
    work: HashMap<TaskId, WorkItem>,
    audit: Vec<AuditEvent>,
}

/// In-memory storage backend. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_lock(&self, resource_key: &str) -> Result<Option<LockRecord>> {
        Ok(self.inner.lock().await.locks.get(resource_key).cloned())
    }

    async fn compare_and_set_lock(
        &self,
        resource_key: &str,
        expected_version: Option<u64>,
        new: Option<LockToken>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock().await;
        let stored = inner.locks.get(resource_key);
        if stored.map(|r| r.version) != expected_version {
            return Ok(CasOutcome::Conflict(stored.cloned()));
        }
        let record = next_record(resource_key, expected_version, new);
        inner.locks.insert(resource_key.to_string(), record.clone());
        Ok(CasOutcome::Applied(record))
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        Ok(self.inner.lock().await.locks.values().cloned().collect())
    }

    async fn append_decision(&self, decision: &RouteDecision) -> Result<()> {
        self.inner.lock().await.decisions.push(decision.clone());
        Ok(())
    }

    async fn list_decisions(&self, task_id: TaskId) -> Result<Vec<RouteDecision>> {
        Ok(self
            .inner
            .lock()
            .await
            .decisions
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn append_reroute(&self, event: &RerouteEvent) -> Result<()> {
        self.inner.lock().await.reroutes.push(event.clone());
        Ok(())
    }

    async fn list_reroutes(&self, task_id: TaskId) -> Result<Vec<RerouteEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .reroutes
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn save_work_item(&self, item: &WorkItem) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let version = check_item_version(item, inner.work.get(&item.task_id).map(|i| i.version))?;
        let mut stored = item.clone();
        stored.version = version;
        inner.work.insert(item.task_id, stored);
        Ok(version)
    }

    async fn load_work_item(&self, task_id: TaskId) -> Result<Option<WorkItem>> {
        Ok(self.inner.lock().await.work.get(&task_id).cloned())
    }

    async fn list_work_items(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<_> = inner.work.values().filter(|i| filter.matches(i)).cloned().collect();
        items.sort_by_key(|i| i.task_id);
        Ok(items)
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.inner.lock().await.audit.push(event.clone());
        Ok(())
    }

    async fn list_audit(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.inner.lock().await.audit.clone())
    }
}
