//! Background retention sweeps over the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use tw_core::config::RetentionConfig;
use tw_storage::TaskStore;

/// Periodically apply the retention windows to the store. Runs until aborted.
pub fn spawn_cleanup_task(
    store: Arc<dyn TaskStore>,
    retention: RetentionConfig,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // first tick completes immediately
        info!(interval_secs = interval.as_secs(), "storage cleanup task started");
        loop {
            timer.tick().await;
            match store.cleanup(&retention).await {
                Ok(report) => {
                    if report.tasks_removed + report.checkpoints_removed + report.dead_letters_removed
                        > 0
                    {
                        info!(
                            tasks = report.tasks_removed,
                            checkpoints = report.checkpoints_removed,
                            dead_letters = report.dead_letters_removed,
                            "cleanup cycle completed"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "cleanup cycle failed"),
            }
        }
    })
}
