//! JSON file storage implementation.
//!
//! Stores lock records and work items as one JSON file each under a root
//! directory, and appends decisions, reroutes and audit events to JSON Lines
//! logs. Work item saves check the stored item's version.
//!
//! Compare-and-set is serialized by an in-process mutex, so one `JsonStorage`
//! (or its clones) must own the directory. Multi-process deployments should
//! use the SQLite backend.

use super::trait_::{check_item_version, next_record, CasOutcome, Result, Storage};
use async_trait::async_trait;
use orca_core::{
    AuditEvent, LockRecord, LockToken, RerouteEvent, RouteDecision, TaskId, WorkFilter, WorkItem,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// File-based JSON storage backend.
#[derive(Clone)]
pub struct JsonStorage {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonStorage {
    /// Create storage, creating the directory layout if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("locks")).await?;
        fs::create_dir_all(root.join("work")).await?;
        fs::create_dir_all(root.join("decisions")).await?;
        fs::create_dir_all(root.join("reroutes")).await?;

        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn lock_path(&self, resource_key: &str) -> PathBuf {
        self.root.join("locks").join(format!("{}.json", encode_key(resource_key)))
    }
    fn work_path(&self, id: TaskId) -> PathBuf {
        self.root.join("work").join(format!("{}.json", id))
    }
    fn decisions_path(&self, id: TaskId) -> PathBuf {
        self.root.join("decisions").join(format!("{}.jsonl", id))
    }
    fn reroutes_path(&self, id: TaskId) -> PathBuf {
        self.root.join("reroutes").join(format!("{}.jsonl", id))
    }
    fn audit_path(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn get_lock(&self, resource_key: &str) -> Result<Option<LockRecord>> {
        read_json(&self.lock_path(resource_key)).await
    }

    async fn compare_and_set_lock(
        &self,
        resource_key: &str,
        expected_version: Option<u64>,
        new: Option<LockToken>,
    ) -> Result<CasOutcome> {
        let _guard = self.write_lock.lock().await;
        let path = self.lock_path(resource_key);
        let stored: Option<LockRecord> = read_json(&path).await?;
        if stored.as_ref().map(|r| r.version) != expected_version {
            return Ok(CasOutcome::Conflict(stored));
        }
        let record = next_record(resource_key, expected_version, new);
        write_atomic(&path, serde_json::to_string_pretty(&record)?.as_bytes()).await?;
        Ok(CasOutcome::Applied(record))
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        let mut records: Vec<LockRecord> = list_dir(&self.root.join("locks")).await?;
        records.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(records)
    }

    async fn append_decision(&self, decision: &RouteDecision) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.decisions_path(decision.task_id), decision).await
    }

    async fn list_decisions(&self, task_id: TaskId) -> Result<Vec<RouteDecision>> {
        read_lines(&self.decisions_path(task_id)).await
    }

    async fn append_reroute(&self, event: &RerouteEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.reroutes_path(event.task_id), event).await
    }

    async fn list_reroutes(&self, task_id: TaskId) -> Result<Vec<RerouteEvent>> {
        read_lines(&self.reroutes_path(task_id)).await
    }

    async fn save_work_item(&self, item: &WorkItem) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let path = self.work_path(item.task_id);
        let stored: Option<WorkItem> = read_json(&path).await?;
        let version = check_item_version(item, stored.map(|i| i.version))?;

        let mut next = item.clone();
        next.version = version;
        write_atomic(&path, serde_json::to_string_pretty(&next)?.as_bytes()).await?;
        Ok(version)
    }

    async fn load_work_item(&self, task_id: TaskId) -> Result<Option<WorkItem>> {
        read_json(&self.work_path(task_id)).await
    }

    async fn list_work_items(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let all: Vec<WorkItem> = list_dir(&self.root.join("work")).await?;
        let mut items: Vec<_> = all.into_iter().filter(|i| filter.matches(i)).collect();
        items.sort_by_key(|i| i.task_id);
        Ok(items)
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.audit_path(), event).await
    }

    async fn list_audit(&self) -> Result<Vec<AuditEvent>> {
        read_lines(&self.audit_path()).await
    }
}

/// Make a resource key safe to use as a file name.
///
/// Alphanumerics, `-` and `.` pass through; every other byte becomes `_xx`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

/// Write via a temporary file and rename so readers never see half a record.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn append_line<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut items = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        items.push(serde_json::from_str(line)?);
    }
    Ok(items)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(items)
}
