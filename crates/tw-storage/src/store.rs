use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tw_core::config::RetentionConfig;
use tw_core::{Checkpoint, DeadLetterEntry, Task, TaskKind, TaskStatus, SCHEMA_VERSION};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(String),
    #[error("serialization: {0}")]
    Serde(String),
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("unsupported schema version {found} (this build reads <= {supported})")]
    SchemaVersion { found: u32, supported: u32 },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Query / report types
// ---------------------------------------------------------------------------

/// Filter for task queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if task.kind != kind {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub tasks: usize,
    pub checkpoints: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub tasks_removed: usize,
    pub checkpoints_removed: usize,
    pub dead_letters_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub tasks: usize,
    pub checkpoints: usize,
    pub dead_letters: usize,
}

/// Full-dataset export envelope, tagged with the schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedData {
    pub schema_version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterEntry>,
}

impl ExportedData {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tasks: Vec::new(),
            checkpoints: Vec::new(),
            dead_letters: Vec::new(),
        }
    }

    /// Reject documents written by a newer schema than this build knows.
    pub fn check_version(&self) -> Result<()> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Uniform persistence surface over the durable, key-value and in-memory
/// backends. Every `save_*` is a single atomic write (upsert); readers see a
/// consistent snapshot of each entity.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    // -- tasks --
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_task(&self, id: &str) -> Result<Option<Task>>;
    async fn delete_task(&self, id: &str) -> Result<bool>;
    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Tasks whose persisted status is pending, queued, or in_progress.
    async fn load_pending_tasks(&self) -> Result<Vec<Task>> {
        let mut pending = Vec::new();
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::InProgress,
        ] {
            pending.extend(
                self.query_tasks(&TaskFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?,
            );
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    // -- checkpoints --
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>>;
    /// Most recently updated checkpoint for a task, if any.
    async fn latest_checkpoint_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>>;
    async fn delete_checkpoint(&self, id: &str) -> Result<bool>;
    async fn delete_checkpoints_for_task(&self, task_id: &str) -> Result<usize>;

    // -- dead-letter queue --
    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()>;
    async fn load_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>>;
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;
    async fn remove_dead_letter(&self, id: &str) -> Result<bool>;

    // -- maintenance --
    async fn cleanup(&self, retention: &RetentionConfig) -> Result<CleanupReport>;
    async fn stats(&self) -> Result<StoreStats>;
    async fn export(&self) -> Result<ExportedData>;
    async fn import(&self, data: ExportedData) -> Result<ImportReport>;
}

// ---------------------------------------------------------------------------
// Shared cleanup predicates
// ---------------------------------------------------------------------------

/// A terminal task is removable once its completion is older than the window.
pub(crate) fn task_expired(task: &Task, now: DateTime<Utc>, retention_ms: u64) -> bool {
    let cutoff = now - Duration::milliseconds(retention_ms as i64);
    match task.completed_at {
        Some(completed) => task.status.is_terminal() && completed < cutoff,
        None => false,
    }
}

pub(crate) fn checkpoint_expired(
    checkpoint: &Checkpoint,
    now: DateTime<Utc>,
    retention_ms: u64,
) -> bool {
    let cutoff = now - Duration::milliseconds(retention_ms as i64);
    checkpoint.updated_at < cutoff
}

pub(crate) fn dead_letter_expired(
    entry: &DeadLetterEntry,
    now: DateTime<Utc>,
    retention_ms: u64,
) -> bool {
    let cutoff = now - Duration::milliseconds(retention_ms as i64);
    entry.is_expired(now) || entry.last_failed_at < cutoff
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
