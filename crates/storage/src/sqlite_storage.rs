//! SQLite storage backend for Orca.
//!
//! Lock records are rows guarded by a version column, so compare-and-set is a
//! single conditional `UPDATE` (or `INSERT ... ON CONFLICT DO NOTHING` for the
//! first grant) and is atomic across processes sharing the database file.
//! Work items carry the same kind of version column.
//! Decisions, reroutes and audit events are append-only tables.

use async_trait::async_trait;
use orca_core::{
    AuditEvent, LockRecord, LockToken, RerouteEvent, RouteDecision, TaskId, WorkFilter, WorkItem,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use super::trait_::{next_record, CasOutcome, Result, Storage, StorageError};

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// Limited to one connection: every connection to `:memory:` is a
    /// separate database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS locks (
                resource_key TEXT PRIMARY KEY,
                token TEXT,
                version INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS decisions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS reroutes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS work_items (
                task_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS audit (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_reroutes_task ON reroutes(task_id)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LockRecord> {
        let resource_key: String = row.try_get("resource_key").map_err(db_err)?;
        let token: Option<String> = row.try_get("token").map_err(db_err)?;
        let version: i64 = row.try_get("version").map_err(db_err)?;
        let current = match token {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(LockRecord {
            resource_key,
            current,
            version: version as u64,
        })
    }

    async fn list_json<T: serde::de::DeserializeOwned>(&self, sql: &str, task_id: Option<TaskId>) -> Result<Vec<T>> {
        let mut query = sqlx::query(sql);
        if let Some(id) = task_id {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("data").map_err(db_err)?;
            items.push(serde_json::from_str(&data)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_lock(&self, resource_key: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query("SELECT resource_key, token, version FROM locks WHERE resource_key = ?")
            .bind(resource_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn compare_and_set_lock(
        &self,
        resource_key: &str,
        expected_version: Option<u64>,
        new: Option<LockToken>,
    ) -> Result<CasOutcome> {
        let token_json = new.as_ref().map(serde_json::to_string).transpose()?;

        let result = match expected_version {
            None => sqlx::query(
                "INSERT INTO locks (resource_key, token, version) VALUES (?, ?, 1)
                ON CONFLICT(resource_key) DO NOTHING",
            )
            .bind(resource_key)
            .bind(token_json)
            .execute(&self.pool)
            .await,
            Some(version) => sqlx::query(
                "UPDATE locks SET token = ?, version = version + 1
                WHERE resource_key = ? AND version = ?",
            )
            .bind(token_json)
            .bind(resource_key)
            .bind(version as i64)
            .execute(&self.pool)
            .await,
        }
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied(next_record(resource_key, expected_version, new)))
        } else {
            Ok(CasOutcome::Conflict(self.get_lock(resource_key).await?))
        }
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        let rows = sqlx::query("SELECT resource_key, token, version FROM locks ORDER BY resource_key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn append_decision(&self, decision: &RouteDecision) -> Result<()> {
        sqlx::query("INSERT INTO decisions (task_id, data) VALUES (?, ?)")
            .bind(decision.task_id.to_string())
            .bind(serde_json::to_string(decision)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_decisions(&self, task_id: TaskId) -> Result<Vec<RouteDecision>> {
        self.list_json("SELECT data FROM decisions WHERE task_id = ? ORDER BY seq", Some(task_id))
            .await
    }

    async fn append_reroute(&self, event: &RerouteEvent) -> Result<()> {
        sqlx::query("INSERT INTO reroutes (task_id, data) VALUES (?, ?)")
            .bind(event.task_id.to_string())
            .bind(serde_json::to_string(event)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_reroutes(&self, task_id: TaskId) -> Result<Vec<RerouteEvent>> {
        self.list_json("SELECT data FROM reroutes WHERE task_id = ? ORDER BY seq", Some(task_id))
            .await
    }

    async fn save_work_item(&self, item: &WorkItem) -> Result<u64> {
        let version = item.version + 1;
        let mut stored = item.clone();
        stored.version = version;
        let data = serde_json::to_string(&stored)?;

        let result = if item.version == 0 {
            sqlx::query(
                "INSERT INTO work_items (task_id, data, updated_at, version) VALUES (?, ?, ?, ?)
                ON CONFLICT(task_id) DO NOTHING",
            )
            .bind(item.task_id.to_string())
            .bind(data)
            .bind(item.updated_at.to_rfc3339())
            .bind(version as i64)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE work_items SET data = ?, updated_at = ?, version = ?
                WHERE task_id = ? AND version = ?",
            )
            .bind(data)
            .bind(item.updated_at.to_rfc3339())
            .bind(version as i64)
            .bind(item.task_id.to_string())
            .bind(item.version as i64)
            .execute(&self.pool)
            .await
        }
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            Ok(version)
        } else {
            Err(StorageError::Conflict(format!(
                "work item {} is not at version {}",
                item.task_id, item.version
            )))
        }
    }

    async fn load_work_item(&self, task_id: TaskId) -> Result<Option<WorkItem>> {
        let row = sqlx::query("SELECT data FROM work_items WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data").map_err(db_err)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn list_work_items(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let all: Vec<WorkItem> = self
            .list_json("SELECT data FROM work_items ORDER BY task_id", None)
            .await?;
        Ok(all.into_iter().filter(|i| filter.matches(i)).collect())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query("INSERT INTO audit (data) VALUES (?)")
            .bind(serde_json::to_string(event)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_audit(&self) -> Result<Vec<AuditEvent>> {
        self.list_json("SELECT data FROM audit ORDER BY seq", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_core::{LockId, NodeType, RouteState};

    fn token(key: &str, holder: &str) -> LockToken {
        let now = chrono::Utc::now();
        LockToken {
            lock_id: LockId::new(),
            task_id: TaskId::new(),
            resource_key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_cas_on_rows() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        assert!(storage
            .compare_and_set_lock("repo:42", None, Some(token("repo:42", "w1")))
            .await
            .unwrap()
            .is_applied());
        assert!(!storage
            .compare_and_set_lock("repo:42", None, Some(token("repo:42", "w2")))
            .await
            .unwrap()
            .is_applied());

        let released = storage.compare_and_set_lock("repo:42", Some(1), None).await.unwrap();
        assert!(released.is_applied());

        let record = storage.get_lock("repo:42").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert!(record.current.is_none());
    }

    #[tokio::test]
    async fn test_work_item_operations() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let now = chrono::Utc::now();
        let mut item = WorkItem::new(TaskId::new(), NodeType::Generate, now);
        item.version = storage.save_work_item(&item).await.unwrap();
        let stale = item.clone();
        item.transition(RouteState::Scoring, now).unwrap();
        item.version = storage.save_work_item(&item).await.unwrap();
        assert_eq!(item.version, 2);

        let loaded = storage.load_work_item(item.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RouteState::Scoring);
        assert_eq!(loaded.version, 2);
        assert_eq!(storage.list_work_items(&WorkFilter::default()).await.unwrap().len(), 1);

        let err = storage.save_work_item(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        let fresh = WorkItem::new(item.task_id, NodeType::Generate, now);
        assert!(storage.save_work_item(&fresh).await.unwrap_err().is_conflict());
        assert_eq!(
            storage.load_work_item(item.task_id).await.unwrap().unwrap().state,
            RouteState::Scoring
        );
    }
}
