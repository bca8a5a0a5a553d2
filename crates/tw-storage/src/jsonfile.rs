use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use tw_core::config::RetentionConfig;
use tw_core::{Checkpoint, DeadLetterEntry, Task};

use crate::store::{
    checkpoint_expired, dead_letter_expired, task_expired, CleanupReport, ExportedData,
    ImportReport, Result, StoreStats, TaskFilter, TaskStore,
};

const TASK_CACHE_CAPACITY: usize = 128;

/// Key-value fallback backend: one JSON file per entity under
/// `tasks/`, `checkpoints/` and `dlq/`, with an LRU read cache for tasks.
pub struct JsonFileStore {
    base_dir: PathBuf,
    task_cache: Mutex<LruCache<String, Task>>,
}

impl JsonFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(TASK_CACHE_CAPACITY).expect("capacity is non-zero");
        Self {
            base_dir: base_dir.into(),
            task_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    fn dlq_dir(&self) -> PathBuf {
        self.base_dir.join("dlq")
    }

    async fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.tasks_dir(), self.checkpoints_dir(), self.dlq_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn write_entity<T: serde::Serialize>(&self, dir: &Path, id: &str, value: &T) -> Result<()> {
        self.ensure_dirs().await?;
        let json = serde_json::to_string_pretty(value)?;
        // Write-then-rename keeps each save atomic at the file level.
        let tmp = dir.join(format!("{id}.json.tmp"));
        let path = dir.join(format!("{id}.json"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_entity<T: serde::de::DeserializeOwned>(
        &self,
        dir: &Path,
        id: &str,
    ) -> Result<Option<T>> {
        let path = dir.join(format!("{id}.json"));
        match tokio::fs::try_exists(&path).await {
            Ok(false) => return Ok(None),
            Err(e) => return Err(e.into()),
            Ok(true) => {}
        }
        let data = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn remove_entity(&self, dir: &Path, id: &str) -> Result<bool> {
        let path = dir.join(format!("{id}.json"));
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {
                tokio::fs::remove_file(path).await?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        self.ensure_dirs().await?;
        let mut out = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(data) => match serde_json::from_str::<T>(&data) {
                    Ok(value) => out.push(value),
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable entity"),
                },
                Err(_) => continue,
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl TaskStore for JsonFileStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.write_entity(&self.tasks_dir(), &task.id, task).await?;
        let mut cache = self.task_cache.lock().await;
        cache.put(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>> {
        {
            let mut cache = self.task_cache.lock().await;
            if let Some(task) = cache.get(id) {
                return Ok(Some(task.clone()));
            }
        }
        let task: Option<Task> = self.read_entity(&self.tasks_dir(), id).await?;
        if let Some(task) = &task {
            let mut cache = self.task_cache.lock().await;
            cache.put(task.id.clone(), task.clone());
        }
        Ok(task)
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let removed = self.remove_entity(&self.tasks_dir(), id).await?;
        self.task_cache.lock().await.pop(id);
        Ok(removed)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .read_all::<Task>(&self.tasks_dir())
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write_entity(&self.checkpoints_dir(), &checkpoint.id, checkpoint)
            .await
    }

    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.read_entity(&self.checkpoints_dir(), id).await
    }

    async fn latest_checkpoint_for_task(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoints: Vec<Checkpoint> = self.read_all(&self.checkpoints_dir()).await?;
        Ok(checkpoints
            .into_iter()
            .filter(|c| c.task_id == task_id)
            .max_by_key(|c| c.updated_at))
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        self.remove_entity(&self.checkpoints_dir(), id).await
    }

    async fn delete_checkpoints_for_task(&self, task_id: &str) -> Result<usize> {
        let checkpoints: Vec<Checkpoint> = self.read_all(&self.checkpoints_dir()).await?;
        let mut removed = 0;
        for cp in checkpoints.iter().filter(|c| c.task_id == task_id) {
            if self.delete_checkpoint(&cp.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.write_entity(&self.dlq_dir(), &entry.id, entry).await
    }

    async fn load_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        self.read_entity(&self.dlq_dir(), id).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = self.read_all(&self.dlq_dir()).await?;
        entries.sort_by(|a, b| a.first_failed_at.cmp(&b.first_failed_at));
        Ok(entries)
    }

    async fn remove_dead_letter(&self, id: &str) -> Result<bool> {
        self.remove_entity(&self.dlq_dir(), id).await
    }

    async fn cleanup(&self, retention: &RetentionConfig) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for task in self.read_all::<Task>(&self.tasks_dir()).await? {
            if task_expired(&task, now, retention.task_ms) && self.delete_task(&task.id).await? {
                report.tasks_removed += 1;
            }
        }
        for cp in self.read_all::<Checkpoint>(&self.checkpoints_dir()).await? {
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
        Ok(StoreStats {
            tasks: self.read_all::<Task>(&self.tasks_dir()).await?.len(),
            checkpoints: self
                .read_all::<Checkpoint>(&self.checkpoints_dir())
                .await?
                .len(),
            dead_letters: self.read_all::<DeadLetterEntry>(&self.dlq_dir()).await?.len(),
        })
    }

    async fn export(&self) -> Result<ExportedData> {
        let mut data = ExportedData::empty();
        data.tasks = self.query_tasks(&TaskFilter::default()).await?;
        data.checkpoints = self.read_all(&self.checkpoints_dir()).await?;
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::{CheckpointReason, ErrorCode, TaskError, TaskKind, TaskResult, TaskStatus};

    fn temp_store() -> (JsonFileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = JsonFileStore::new(dir.path());
        (store, dir)
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let (store, _dir) = temp_store();
        let mut task = Task::new(TaskKind::Coder, "build the module");
        task.begin().unwrap();

        store.save_task(&task).await.unwrap();
        let loaded = store.load_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.prompt, "build the module");
    }

    #[tokio::test]
    async fn load_hits_cache_after_first_read() {
        let (store, dir) = temp_store();
        let task = Task::new(TaskKind::Explore, "scan");
        store.save_task(&task).await.unwrap();

        // Remove the backing file; the cache should still serve the entity.
        let path = dir.path().join("tasks").join(format!("{}.json", task.id));
        std::fs::remove_file(&path).unwrap();

        let loaded = store.load_task(&task.id).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn delete_clears_cache_too() {
        let (store, _dir) = temp_store();
        let task = Task::new(TaskKind::Explore, "scan");
        store.save_task(&task).await.unwrap();

        assert!(store.delete_task(&task.id).await.unwrap());
        assert!(store.load_task(&task.id).await.unwrap().is_none());
        assert!(!store.delete_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn query_applies_filter_and_limit() {
        let (store, _dir) = temp_store();
        for i in 0..5 {
            store
                .save_task(&Task::new(TaskKind::Tester, format!("t{i}")))
                .await
                .unwrap();
        }
        let mut done = Task::new(TaskKind::Tester, "done");
        done.begin().unwrap();
        done.finish(TaskResult::ok("x")).unwrap();
        store.save_task(&done).await.unwrap();

        let found = store
            .query_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                limit: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped() {
        let (store, dir) = temp_store();
        store
            .save_task(&Task::new(TaskKind::Explore, "good"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("tasks").join("junk.json"), "{not json").unwrap();

        let tasks = store.query_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn checkpoints_and_dlq_roundtrip() {
        let (store, _dir) = temp_store();
        let task = Task::new(TaskKind::Fixer, "fix");

        let cp = Checkpoint::new(&task, CheckpointReason::Pause);
        store.save_checkpoint(&cp).await.unwrap();
        let latest = store
            .latest_checkpoint_for_task(&task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, cp.id);

        let entry = DeadLetterEntry::new(
            task,
            TaskError::new(ErrorCode::ToolTimeout, "slow"),
            chrono::Duration::hours(1),
        );
        store.save_dead_letter(&entry).await.unwrap();
        assert_eq!(store.list_dead_letters().await.unwrap().len(), 1);
        assert!(store.remove_dead_letter(&entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_all_kinds() {
        let (store, _dir) = temp_store();
        let task = Task::new(TaskKind::Builder, "b");
        store.save_task(&task).await.unwrap();
        store
            .save_checkpoint(&Checkpoint::new(&task, CheckpointReason::Auto))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.dead_letters, 0);
    }
}
