//! Dead-letter queue: terminally-failed tasks held for retry or expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tw_core::{DeadLetterEntry, EventBus, RuntimeEvent, Task, TaskError};
use tw_harness::{BreakerRegistry, CircuitState};
use tw_storage::{StoreError, TaskStore};

// ---------------------------------------------------------------------------
// Errors / config
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, DlqError>;

#[derive(Debug, Clone)]
pub struct AutoRetryConfig {
    pub poll_interval: Duration,
    /// Delay before the first retry; doubles per recorded attempt.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// DeadLetterQueue
// ---------------------------------------------------------------------------

pub struct DeadLetterQueue {
    store: Arc<dyn TaskStore>,
    ttl: chrono::Duration,
    event_bus: EventBus,
    breakers: Arc<BreakerRegistry>,
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ttl_ms: u64,
        event_bus: EventBus,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            store,
            ttl: chrono::Duration::milliseconds(ttl_ms.min(i64::MAX as u64) as i64),
            event_bus,
            breakers,
        }
    }

    /// Enrol a failed task. A repeated failure of the same task updates the
    /// existing entry: attempts increments and `last_failed_at` refreshes,
    /// which pushes the next auto-retry further out.
    pub async fn add(&self, task: Task, error: TaskError) -> Result<DeadLetterEntry> {
        let existing = self
            .store
            .list_dead_letters()
            .await?
            .into_iter()
            .find(|entry| entry.task.id == task.id);

        let entry = match existing {
            Some(mut entry) => {
                entry.attempts += 1;
                entry.last_failed_at = Utc::now();
                entry.error = error;
                entry.task = task;
                entry
            }
            None => DeadLetterEntry::new(task, error, self.ttl),
        };

        self.store.save_dead_letter(&entry).await?;
        info!(
            entry_id = %entry.id,
            task_id = %entry.task.id,
            attempts = entry.attempts,
            "task enrolled in dead-letter queue"
        );
        self.event_bus.publish(RuntimeEvent::DeadLetterAdded {
            entry_id: entry.id.clone(),
            task_id: entry.task.id.clone(),
        });
        Ok(entry)
    }

    pub async fn list(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.store.list_dead_letters().await?)
    }

    pub async fn remove(&self, entry_id: &str) -> Result<bool> {
        Ok(self.store.remove_dead_letter(entry_id).await?)
    }

    /// Remove expired entries. Returns the number purged.
    pub async fn purge(&self) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for entry in self.store.list_dead_letters().await? {
            if entry.is_expired(now) && self.store.remove_dead_letter(&entry.id).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(count = purged, "purged expired dead-letter entries");
            self.event_bus
                .publish(RuntimeEvent::DeadLetterPurged { count: purged });
        }
        Ok(purged)
    }

    /// Atomically take an entry out of the queue and return its task reset
    /// for another run: status pending, result cleared, retry count bumped.
    pub async fn retry(&self, entry_id: &str) -> Result<Task> {
        let entry = self
            .store
            .load_dead_letter(entry_id)
            .await?
            .ok_or_else(|| DlqError::NotFound(entry_id.to_string()))?;
        if !self.store.remove_dead_letter(entry_id).await? {
            // Lost the race with another retry or the purger.
            return Err(DlqError::NotFound(entry_id.to_string()));
        }

        let mut task = entry.task;
        task.reset_for_retry();
        self.store.save_task(&task).await?;

        info!(entry_id, task_id = %task.id, retry = task.metadata.retry_count, "dead-letter retry");
        self.event_bus.publish(RuntimeEvent::DeadLetterRetried {
            entry_id: entry_id.to_string(),
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    /// Back-off delay for an entry: `base * 2^(attempts-1)`, capped.
    fn backoff_delay(config: &AutoRetryConfig, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let delay = config.base_delay.saturating_mul(1u32 << shift);
        delay.min(config.max_delay)
    }

    fn entry_due(entry: &DeadLetterEntry, config: &AutoRetryConfig) -> bool {
        let delay = Self::backoff_delay(config, entry.attempts);
        let due_at = entry.last_failed_at
            + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
        Utc::now() >= due_at
    }

    /// Start the auto-retry loop. Due entries are retried and their reset
    /// tasks handed to `sink` for re-submission; entries whose target agent's
    /// circuit is open are left for the next poll.
    pub fn start_auto_retry(
        self: &Arc<Self>,
        sink: flume::Sender<Task>,
        config: AutoRetryConfig,
    ) -> JoinHandle<()> {
        let dlq = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = dlq.purge().await {
                    warn!(error = %e, "dead-letter purge failed");
                }

                let entries = match dlq.list().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "dead-letter listing failed");
                        continue;
                    }
                };

                for entry in entries {
                    if !Self::entry_due(&entry, &config) {
                        continue;
                    }
                    if let Some(agent) = entry.task.kind.as_agent() {
                        if dlq.breakers.breaker(agent).state() == CircuitState::Open {
                            debug!(entry_id = %entry.id, %agent, "circuit open; deferring retry");
                            continue;
                        }
                    }
                    match dlq.retry(&entry.id).await {
                        Ok(task) => {
                            if sink.send(task).is_err() {
                                // Receiver gone; stop the loop.
                                return;
                            }
                        }
                        Err(DlqError::NotFound(_)) => {}
                        Err(e) => warn!(error = %e, "auto-retry failed"),
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
