//! Checkpoint scheduling: time, progress, token, and event triggers.
//!
//! The orchestrator registers a state provider per task; the scheduler asks
//! it for a snapshot whenever a trigger fires and persists the result. All
//! snapshots carry a deep copy of the task and message history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tw_core::config::CheckpointConfig;
use tw_core::{Checkpoint, CheckpointReason, EventBus, RuntimeEvent};
use tw_storage::TaskStore;

// ---------------------------------------------------------------------------
// StateProvider
// ---------------------------------------------------------------------------

/// Produces the current checkpointable state of a task on demand.
#[async_trait::async_trait]
pub trait StateProvider: Send + Sync {
    async fn capture(&self, reason: CheckpointReason) -> Checkpoint;
}

// ---------------------------------------------------------------------------
// Triggers and stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Interval,
    Progress,
    Tokens,
    Event,
}

#[derive(Debug, Default)]
struct TriggerCounters {
    interval: AtomicU64,
    progress: AtomicU64,
    tokens: AtomicU64,
    event: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub interval: u64,
    pub progress: u64,
    pub tokens: u64,
    pub event: u64,
}

struct Schedule {
    task_id: String,
    trigger: Trigger,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// CheckpointScheduler
// ---------------------------------------------------------------------------

pub struct CheckpointScheduler {
    store: Arc<dyn TaskStore>,
    config: CheckpointConfig,
    event_bus: EventBus,
    providers: Arc<DashMap<String, Arc<dyn StateProvider>>>,
    schedules: DashMap<String, Schedule>,
    last_progress: DashMap<String, f64>,
    last_tokens: DashMap<String, u64>,
    counters: Arc<TriggerCounters>,
}

impl CheckpointScheduler {
    pub fn new(store: Arc<dyn TaskStore>, config: CheckpointConfig, event_bus: EventBus) -> Self {
        Self {
            store,
            config,
            event_bus,
            providers: Arc::new(DashMap::new()),
            schedules: DashMap::new(),
            last_progress: DashMap::new(),
            last_tokens: DashMap::new(),
            counters: Arc::new(TriggerCounters::default()),
        }
    }

    /// Register the provider that snapshots a task's state.
    pub fn register_provider(&self, task_id: impl Into<String>, provider: Arc<dyn StateProvider>) {
        self.providers.insert(task_id.into(), provider);
    }

    /// Start the interval trigger for a task. Returns the schedule id.
    pub fn start_interval(&self, task_id: impl Into<String>) -> String {
        let task_id = task_id.into();
        let schedule_id = Uuid::new_v4().to_string();

        let store = Arc::clone(&self.store);
        let providers = Arc::clone(&self.providers);
        let counters = Arc::clone(&self.counters);
        let event_bus = self.event_bus.clone();
        let interval_ms = self.config.interval_ms;
        let task_id_for_loop = task_id.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;
                let Some(provider) = providers
                    .get(&task_id_for_loop)
                    .map(|entry| Arc::clone(entry.value()))
                else {
                    break;
                };
                let checkpoint = provider.capture(CheckpointReason::Auto).await;
                let checkpoint_id = checkpoint.id.clone();
                match store.save_checkpoint(&checkpoint).await {
                    Ok(()) => {
                        counters.interval.fetch_add(1, Ordering::Relaxed);
                        event_bus.publish(RuntimeEvent::CheckpointCreated {
                            task_id: task_id_for_loop.clone(),
                            checkpoint_id,
                            reason: CheckpointReason::Auto,
                        });
                    }
                    Err(e) => warn!(task_id = %task_id_for_loop, error = %e, "interval checkpoint failed"),
                }
            }
        });

        self.schedules.insert(
            schedule_id.clone(),
            Schedule {
                task_id,
                trigger: Trigger::Interval,
                handle,
            },
        );
        schedule_id
    }

    /// Observe a progress value in `0.0..=1.0`; snapshots when growth since
    /// the last snapshot reaches the configured threshold.
    pub async fn on_progress(&self, task_id: &str, progress: f64) -> Option<String> {
        let last = self
            .last_progress
            .get(task_id)
            .map(|entry| *entry.value())
            .unwrap_or(0.0);
        if progress - last < self.config.progress_threshold {
            return None;
        }
        self.last_progress.insert(task_id.to_string(), progress);
        self.counters.progress.fetch_add(1, Ordering::Relaxed);
        self.snapshot(task_id, CheckpointReason::Auto, Some(("progress", progress.to_string())))
            .await
    }

    /// Observe cumulative token usage; snapshots when growth since the last
    /// snapshot reaches the configured threshold.
    pub async fn on_tokens(&self, task_id: &str, total_tokens: u64) -> Option<String> {
        let last = self
            .last_tokens
            .get(task_id)
            .map(|entry| *entry.value())
            .unwrap_or(0);
        if total_tokens.saturating_sub(last) < self.config.token_threshold {
            return None;
        }
        self.last_tokens.insert(task_id.to_string(), total_tokens);
        self.counters.tokens.fetch_add(1, Ordering::Relaxed);
        self.snapshot(task_id, CheckpointReason::Auto, Some(("tokens", total_tokens.to_string())))
            .await
    }

    /// Explicit event trigger: delegation before/after, sub-task completion,
    /// error, or a manual request.
    pub async fn on_event(
        &self,
        task_id: &str,
        reason: CheckpointReason,
        label: &str,
    ) -> Option<String> {
        self.counters.event.fetch_add(1, Ordering::Relaxed);
        self.snapshot(task_id, reason, Some(("event", label.to_string())))
            .await
    }

    async fn snapshot(
        &self,
        task_id: &str,
        reason: CheckpointReason,
        tag: Option<(&str, String)>,
    ) -> Option<String> {
        let provider = self
            .providers
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))?;
        let mut checkpoint = provider.capture(reason).await;
        if let Some((key, value)) = tag {
            checkpoint
                .metadata
                .insert(key.to_string(), serde_json::Value::String(value));
        }
        let checkpoint_id = checkpoint.id.clone();
        match self.store.save_checkpoint(&checkpoint).await {
            Ok(()) => {
                debug!(task_id, checkpoint_id = %checkpoint_id, ?reason, "checkpoint saved");
                self.event_bus.publish(RuntimeEvent::CheckpointCreated {
                    task_id: task_id.to_string(),
                    checkpoint_id: checkpoint_id.clone(),
                    reason,
                });
                Some(checkpoint_id)
            }
            Err(e) => {
                warn!(task_id, error = %e, "checkpoint save failed");
                None
            }
        }
    }

    /// Cancel one schedule by id.
    pub fn cancel_schedule(&self, schedule_id: &str) -> bool {
        match self.schedules.remove(schedule_id) {
            Some((_, schedule)) => {
                schedule.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every schedule for a task and drop its provider and trackers.
    pub fn cancel_for_task(&self, task_id: &str) -> usize {
        let ids: Vec<String> = self
            .schedules
            .iter()
            .filter(|entry| entry.value().task_id == task_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_schedule(&id) {
                cancelled += 1;
            }
        }
        self.providers.remove(task_id);
        self.last_progress.remove(task_id);
        self.last_tokens.remove(task_id);
        cancelled
    }

    pub fn schedule_trigger(&self, schedule_id: &str) -> Option<Trigger> {
        self.schedules.get(schedule_id).map(|s| s.trigger)
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            interval: self.counters.interval.load(Ordering::Relaxed),
            progress: self.counters.progress.load(Ordering::Relaxed),
            tokens: self.counters.tokens.load(Ordering::Relaxed),
            event: self.counters.event.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use tw_core::{Task, TaskKind};
    use tw_storage::MemoryStore;

    struct SharedTaskProvider {
        task: Arc<Mutex<Task>>,
    }

    #[async_trait::async_trait]
    impl StateProvider for SharedTaskProvider {
        async fn capture(&self, reason: CheckpointReason) -> Checkpoint {
            let task = self.task.lock().await;
            Checkpoint::new(&task, reason)
        }
    }

    fn scheduler_with(
        store: Arc<dyn TaskStore>,
        config: CheckpointConfig,
    ) -> (CheckpointScheduler, Arc<Mutex<Task>>, String) {
        let scheduler = CheckpointScheduler::new(store, config, EventBus::new());
        let task = Task::new(TaskKind::Orchestrator, "checkpointed work");
        let task_id = task.id.clone();
        let shared = Arc::new(Mutex::new(task));
        scheduler.register_provider(
            task_id.clone(),
            Arc::new(SharedTaskProvider {
                task: Arc::clone(&shared),
            }),
        );
        (scheduler, shared, task_id)
    }

    #[tokio::test]
    async fn interval_trigger_saves_checkpoints() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, _task, task_id) = scheduler_with(
            Arc::clone(&store),
            CheckpointConfig {
                interval_ms: 10,
                ..Default::default()
            },
        );

        let schedule_id = scheduler.start_interval(&task_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel_schedule(&schedule_id);

        assert!(scheduler.stats().interval >= 2);
        let latest = store.latest_checkpoint_for_task(&task_id).await.unwrap();
        assert!(latest.is_some());
        assert_eq!(latest.unwrap().reason, CheckpointReason::Auto);
    }

    #[tokio::test]
    async fn progress_trigger_respects_threshold() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, _task, task_id) =
            scheduler_with(Arc::clone(&store), CheckpointConfig::default());

        // Below the 0.10 default threshold: no checkpoint.
        assert!(scheduler.on_progress(&task_id, 0.05).await.is_none());
        // Crosses it.
        assert!(scheduler.on_progress(&task_id, 0.15).await.is_some());
        // Needs another 0.10 of growth from the last snapshot.
        assert!(scheduler.on_progress(&task_id, 0.20).await.is_none());
        assert!(scheduler.on_progress(&task_id, 0.30).await.is_some());

        assert_eq!(scheduler.stats().progress, 2);
    }

    #[tokio::test]
    async fn token_trigger_respects_threshold() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, _task, task_id) =
            scheduler_with(Arc::clone(&store), CheckpointConfig::default());

        assert!(scheduler.on_tokens(&task_id, 5_000).await.is_none());
        assert!(scheduler.on_tokens(&task_id, 12_000).await.is_some());
        assert!(scheduler.on_tokens(&task_id, 15_000).await.is_none());
        assert!(scheduler.on_tokens(&task_id, 25_000).await.is_some());
    }

    #[tokio::test]
    async fn event_trigger_tags_checkpoint() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, _task, task_id) =
            scheduler_with(Arc::clone(&store), CheckpointConfig::default());

        let checkpoint_id = scheduler
            .on_event(&task_id, CheckpointReason::Error, "delegation_failed")
            .await
            .unwrap();

        let checkpoint = store.load_checkpoint(&checkpoint_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.reason, CheckpointReason::Error);
        assert_eq!(
            checkpoint.metadata.get("event").and_then(|v| v.as_str()),
            Some("delegation_failed")
        );
        assert_eq!(scheduler.stats().event, 1);
    }

    #[tokio::test]
    async fn snapshot_is_deep_copy_of_current_state() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, task, task_id) =
            scheduler_with(Arc::clone(&store), CheckpointConfig::default());

        task.lock().await.begin().unwrap();
        let id = scheduler
            .on_event(&task_id, CheckpointReason::UserRequest, "manual")
            .await
            .unwrap();

        // Mutate afterwards; the stored copy must not change.
        task.lock()
            .await
            .finish(tw_core::TaskResult::ok("done"))
            .unwrap();

        let checkpoint = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.task.status, tw_core::TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn cancel_for_task_stops_interval_and_drops_provider() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let (scheduler, _task, task_id) = scheduler_with(
            Arc::clone(&store),
            CheckpointConfig {
                interval_ms: 5,
                ..Default::default()
            },
        );

        scheduler.start_interval(&task_id);
        scheduler.start_interval(&task_id);
        assert_eq!(scheduler.cancel_for_task(&task_id), 2);

        // Provider gone: event trigger now does nothing.
        assert!(scheduler
            .on_event(&task_id, CheckpointReason::Auto, "late")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unknown_task_produces_no_checkpoint() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let scheduler =
            CheckpointScheduler::new(store, CheckpointConfig::default(), EventBus::new());
        assert!(scheduler.on_progress("ghost", 0.9).await.is_none());
    }
}
