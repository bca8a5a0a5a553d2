use std::path::Path;

use chrono::Utc;
use tokio_rusqlite::Connection;
use tracing::info;

use tw_core::config::RetentionConfig;
use tw_core::{Checkpoint, DeadLetterEntry, Task};

use crate::store::{
    checkpoint_expired, dead_letter_expired, task_expired, CleanupReport, ExportedData,
    ImportReport, Result, StoreError, StoreStats, TaskFilter, TaskStore,
};

fn sql_err(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Sqlite(e.to_string())
}

/// Durable SQLite-backed store. Entities are persisted as JSON documents with
/// the queried fields mirrored into indexed columns; each save is a single
/// upsert statement.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await.map_err(sql_err)?;
        let store = Self { conn };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(store)
    }

    /// Purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.map_err(sql_err)?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id         TEXT PRIMARY KEY,
                        status     TEXT NOT NULL,
                        kind       TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tasks_status     ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
                    CREATE INDEX IF NOT EXISTS idx_tasks_kind       ON tasks(kind);

                    CREATE TABLE IF NOT EXISTS checkpoints (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_checkpoints_task_id    ON checkpoints(task_id);
                    CREATE INDEX IF NOT EXISTS idx_checkpoints_updated_at ON checkpoints(updated_at);

                    CREATE TABLE IF NOT EXISTS dead_letter_queue (
                        id         TEXT PRIMARY KEY,
                        task_id    TEXT NOT NULL,
                        expires_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_dlq_expires_at ON dead_letter_queue(expires_at);
                    CREATE INDEX IF NOT EXISTS idx_dlq_task_id    ON dead_letter_queue(task_id);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(sql_err)
    }

    fn enum_column<T: serde::Serialize>(value: &T) -> String {
        serde_json::to_string(value)
            .expect("serialize enum")
            .trim_matches('"')
            .to_string()
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let id = task.id.clone();
        let status = Self::enum_column(&task.status);
        let kind = Self::enum_column(&task.kind);
        let created_at = task.created_at.to_rfc3339();
        let data = serde_json::to_string(task)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, status, kind, created_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        status=excluded.status, kind=excluded.kind, data=excluded.data",
                    rusqlite::params![id, status, kind, created_at, data],
                )?;
                Ok(())
            })
            .await
            .map_err(sql_err)
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM tasks WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(sql_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
                Ok(n)
            })
            .await
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        // Status is pushed into SQL (indexed); the rest of the filter is
        // applied on the decoded documents.
        let status = filter.status.map(|s| Self::enum_column(&s));
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(
                            "SELECT data FROM tasks WHERE status = ?1 ORDER BY created_at",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![status])?;
                        while let Some(row) = rows.next()? {
                            out.push(row.get::<_, String>(0)?);
                        }
                    }
                    None => {
                        let mut stmt =
                            conn.prepare("SELECT data FROM tasks ORDER BY created_at")?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            out.push(row.get::<_, String>(0)?);
                        }
                    }
                }
                Ok(out)
            })
            .await
            .map_err(sql_err)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for raw in rows {
            let task: Task = serde_json::from_str(&raw)?;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let id = checkpoint.id.clone();
        let task_id = checkpoint.task_id.clone();
        let updated_at = checkpoint.updated_at.to_rfc3339();
        let data = serde_json::to_string(checkpoint)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints (id, task_id, updated_at, data)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        task_id=excluded.task_id, updated_at=excluded.updated_at,
                        data=excluded.data",
                    rusqlite::params![id, task_id, updated_at, data],
                )?;
                Ok(())
            })
            .await
            .map_err(sql_err)
    }

    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let id = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM checkpoints WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(sql_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn latest_checkpoint_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM checkpoints WHERE task_id = ?1
                     ORDER BY updated_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(sql_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM checkpoints WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n)
            })
            .await
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    async fn delete_checkpoints_for_task(&self, task_id: &str) -> Result<usize> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM checkpoints WHERE task_id = ?1",
                    rusqlite::params![task_id],
                )?;
                Ok(n)
            })
            .await
            .map_err(sql_err)
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        let id = entry.id.clone();
        let task_id = entry.task.id.clone();
        let expires_at = entry.expires_at.to_rfc3339();
        let data = serde_json::to_string(entry)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dead_letter_queue (id, task_id, expires_at, data)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        task_id=excluded.task_id, expires_at=excluded.expires_at,
                        data=excluded.data",
                    rusqlite::params![id, task_id, expires_at, data],
                )?;
                Ok(())
            })
            .await
            .map_err(sql_err)
    }

    async fn load_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        let id = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM dead_letter_queue WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(sql_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM dead_letter_queue ORDER BY expires_at")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await
            .map_err(sql_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            entries.push(serde_json::from_str(&raw)?);
        }
        Ok(entries)
    }

    async fn remove_dead_letter(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM dead_letter_queue WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n)
            })
            .await
            .map_err(sql_err)?;
        Ok(removed > 0)
    }

    async fn cleanup(&self, retention: &RetentionConfig) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        let expired_tasks: Vec<String> = self
            .query_tasks(&TaskFilter::default())
            .await?
            .into_iter()
            .filter(|t| task_expired(t, now, retention.task_ms))
            .map(|t| t.id)
            .collect();
        for id in &expired_tasks {
            if self.delete_task(id).await? {
                report.tasks_removed += 1;
            }
        }

        let checkpoints = self.export_checkpoints().await?;
        for cp in checkpoints {
            if checkpoint_expired(&cp, now, retention.checkpoint_ms)
                && self.delete_checkpoint(&cp.id).await?
            {
                report.checkpoints_removed += 1;
            }
        }

        for entry in self.list_dead_letters().await? {
            if dead_letter_expired(&entry, now, retention.dlq_ms)
                && self.remove_dead_letter(&entry.id).await?
            {
                report.dead_letters_removed += 1;
            }
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.conn
            .call(|conn| {
                let tasks: usize =
                    conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?;
                let checkpoints: usize =
                    conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
                let dead_letters: usize =
                    conn.query_row("SELECT COUNT(*) FROM dead_letter_queue", [], |r| r.get(0))?;
                Ok(StoreStats {
                    tasks,
                    checkpoints,
                    dead_letters,
                })
            })
            .await
            .map_err(sql_err)
    }

    async fn export(&self) -> Result<ExportedData> {
        let mut data = ExportedData::empty();
        data.tasks = self.query_tasks(&TaskFilter::default()).await?;
        data.checkpoints = self.export_checkpoints().await?;
        data.dead_letters = self.list_dead_letters().await?;
        Ok(data)
    }

    async fn import(&self, data: ExportedData) -> Result<ImportReport> {
        data.check_version()?;
        let report = ImportReport {
            tasks: data.tasks.len(),
            checkpoints: data.checkpoints.len(),
            dead_letters: data.dead_letters.len(),
        };
        for task in &data.tasks {
            self.save_task(task).await?;
        }
        for cp in &data.checkpoints {
            self.save_checkpoint(cp).await?;
        }
        for entry in &data.dead_letters {
            self.save_dead_letter(entry).await?;
        }
        Ok(report)
    }
}

impl SqliteStore {
    async fn export_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM checkpoints ORDER BY updated_at")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await
            .map_err(sql_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for raw in rows {
            checkpoints.push(serde_json::from_str(&raw)?);
        }
        Ok(checkpoints)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
