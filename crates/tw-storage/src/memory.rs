use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use tw_core::config::RetentionConfig;
use tw_core::{Checkpoint, DeadLetterEntry, Task};

use crate::store::{
    checkpoint_expired, dead_letter_expired, task_expired, CleanupReport, ExportedData,
    ImportReport, Result, StoreStats, TaskFilter, TaskStore,
};

/// Volatile backend; the last-resort fallback and the test workhorse.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    dead_letters: RwLock<HashMap<String, DeadLetterEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(id).cloned())
    }

    async fn latest_checkpoint_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .values()
            .filter(|c| c.task_id == task_id)
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        Ok(self.checkpoints.write().await.remove(id).is_some())
    }

    async fn delete_checkpoints_for_task(&self, task_id: &str) -> Result<usize> {
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|_, c| c.task_id != task_id);
        Ok(before - checkpoints.len())
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.dead_letters
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn load_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(self.dead_letters.read().await.get(id).cloned())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> =
            self.dead_letters.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.first_failed_at.cmp(&b.first_failed_at));
        Ok(entries)
    }

    async fn remove_dead_letter(&self, id: &str) -> Result<bool> {
        Ok(self.dead_letters.write().await.remove(id).is_some())
    }

    async fn cleanup(&self, retention: &RetentionConfig) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|_, t| !task_expired(t, now, retention.task_ms));
            report.tasks_removed = before - tasks.len();
        }
        {
            let mut checkpoints = self.checkpoints.write().await;
            let before = checkpoints.len();
            checkpoints.retain(|_, c| !checkpoint_expired(c, now, retention.checkpoint_ms));
            report.checkpoints_removed = before - checkpoints.len();
        }
        {
            let mut dead_letters = self.dead_letters.write().await;
            let before = dead_letters.len();
            dead_letters.retain(|_, d| !dead_letter_expired(d, now, retention.dlq_ms));
            report.dead_letters_removed = before - dead_letters.len();
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            tasks: self.tasks.read().await.len(),
            checkpoints: self.checkpoints.read().await.len(),
            dead_letters: self.dead_letters.read().await.len(),
        })
    }

    async fn export(&self) -> Result<ExportedData> {
        let mut data = ExportedData::empty();
        data.tasks = self.tasks.read().await.values().cloned().collect();
        data.checkpoints = self.checkpoints.read().await.values().cloned().collect();
        data.dead_letters = self.dead_letters.read().await.values().cloned().collect();
        data.tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(data)
    }

    async fn import(&self, data: ExportedData) -> Result<ImportReport> {
        data.check_version()?;
        let report = ImportReport {
            tasks: data.tasks.len(),
            checkpoints: data.checkpoints.len(),
            dead_letters: data.dead_letters.len(),
        };
        {
            let mut tasks = self.tasks.write().await;
            for task in data.tasks {
                tasks.insert(task.id.clone(), task);
            }
        }
        {
            let mut checkpoints = self.checkpoints.write().await;
            for cp in data.checkpoints {
                checkpoints.insert(cp.id.clone(), cp);
            }
        }
        {
            let mut dead_letters = self.dead_letters.write().await;
            for entry in data.dead_letters {
                dead_letters.insert(entry.id.clone(), entry);
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tw_core::{CheckpointReason, ErrorCode, TaskError, TaskKind, TaskResult, TaskStatus};

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn save_load_roundtrip_preserves_fields() {
        let store = store();
        let mut task = Task::new(TaskKind::Coder, "write the thing");
        task.metadata.decomposition_depth = 3;
        task.begin().unwrap();

        store.save_task(&task).await.unwrap();
        let loaded = store.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.metadata.decomposition_depth, 3);
        assert_eq!(loaded.started_at, task.started_at);
    }

    #[tokio::test]
    async fn load_pending_tasks_filters_terminal() {
        let store = store();

        let pending = Task::new(TaskKind::Explore, "a");
        let mut queued = Task::new(TaskKind::Explore, "b");
        queued.enqueue().unwrap();
        let mut running = Task::new(TaskKind::Explore, "c");
        running.begin().unwrap();
        let mut done = Task::new(TaskKind::Explore, "d");
        done.begin().unwrap();
        done.finish(TaskResult::ok("done")).unwrap();

        for t in [&pending, &queued, &running, &done] {
            store.save_task(t).await.unwrap();
        }

        let loaded = store.load_pending_tasks().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.iter().all(|t| !t.status.is_terminal()));
    }

    #[tokio::test]
    async fn latest_checkpoint_wins_by_updated_at() {
        let store = store();
        let task = Task::new(TaskKind::Coder, "x");

        let mut old = Checkpoint::new(&task, CheckpointReason::Auto);
        old.updated_at = Utc::now() - Duration::minutes(10);
        let new = Checkpoint::new(&task, CheckpointReason::Error);

        store.save_checkpoint(&old).await.unwrap();
        store.save_checkpoint(&new).await.unwrap();

        let latest = store
            .latest_checkpoint_for_task(&task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, new.id);
        assert_eq!(latest.reason, CheckpointReason::Error);
    }

    #[tokio::test]
    async fn delete_checkpoints_for_task_counts() {
        let store = store();
        let task_a = Task::new(TaskKind::Coder, "a");
        let task_b = Task::new(TaskKind::Coder, "b");

        for _ in 0..3 {
            store
                .save_checkpoint(&Checkpoint::new(&task_a, CheckpointReason::Auto))
                .await
                .unwrap();
        }
        store
            .save_checkpoint(&Checkpoint::new(&task_b, CheckpointReason::Auto))
            .await
            .unwrap();

        assert_eq!(
            store.delete_checkpoints_for_task(&task_a.id).await.unwrap(),
            3
        );
        assert_eq!(store.stats().await.unwrap().checkpoints, 1);
    }

    #[tokio::test]
    async fn cleanup_applies_retention_windows() {
        let store = store();
        let retention = RetentionConfig::default();
        let now = Utc::now();

        let mut stale = Task::new(TaskKind::Tester, "old");
        stale.begin().unwrap();
        stale.finish(TaskResult::ok("done")).unwrap();
        stale.completed_at = Some(now - Duration::days(8));
        store.save_task(&stale).await.unwrap();

        let fresh = Task::new(TaskKind::Tester, "new");
        store.save_task(&fresh).await.unwrap();

        let mut old_cp = Checkpoint::new(&fresh, CheckpointReason::Auto);
        old_cp.updated_at = now - Duration::hours(25);
        store.save_checkpoint(&old_cp).await.unwrap();

        let expired_dlq = DeadLetterEntry::new(
            Task::new(TaskKind::Builder, "dead"),
            TaskError::new(ErrorCode::AgentError, "x"),
            Duration::hours(-1),
        );
        store.save_dead_letter(&expired_dlq).await.unwrap();

        let report = store.cleanup(&retention).await.unwrap();
        assert_eq!(report.tasks_removed, 1);
        assert_eq!(report.checkpoints_removed, 1);
        assert_eq!(report.dead_letters_removed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.checkpoints, 0);
        assert_eq!(stats.dead_letters, 0);
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let source = store();
        let task = Task::new(TaskKind::Reviewer, "review");
        source.save_task(&task).await.unwrap();
        source
            .save_checkpoint(&Checkpoint::new(&task, CheckpointReason::Auto))
            .await
            .unwrap();

        let exported = source.export().await.unwrap();
        assert_eq!(exported.schema_version, tw_core::SCHEMA_VERSION);

        let target = store();
        let report = target.import(exported).await.unwrap();
        assert_eq!(report.tasks, 1);
        assert_eq!(report.checkpoints, 1);
        assert!(target.load_task(&task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn import_rejects_newer_schema() {
        let store = store();
        let mut data = ExportedData::empty();
        data.schema_version = tw_core::SCHEMA_VERSION + 1;
        assert!(store.import(data).await.is_err());
    }
}
