//! Persistence for tasks, checkpoints, and dead-letter entries.
//!
//! One trait, three backends: durable sqlite, JSON-file key-value, and
//! in-memory. [`open_store`] applies the startup fallback chain.

pub mod jsonfile;
pub mod memory;
pub mod sqlite;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tw_core::config::StorageConfig;

pub use jsonfile::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{
    CleanupReport, ExportedData, ImportReport, Result, StoreError, StoreStats, TaskFilter,
    TaskStore,
};

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(dir),
    }
}

/// Open a store for the configured directory.
///
/// Tries the durable sqlite backend first, falls back to the JSON-file
/// key-value backend, and finally to in-memory. Each fallback is logged; the
/// in-memory backend cannot fail.
pub async fn open_store(config: &StorageConfig) -> Arc<dyn TaskStore> {
    let base = expand_home(&config.dir);

    if tokio::fs::create_dir_all(&base).await.is_ok() {
        match SqliteStore::open(base.join("taskweave.db")).await {
            Ok(store) => {
                info!(dir = %base.display(), backend = "sqlite", "storage ready");
                return Arc::new(store);
            }
            Err(e) => {
                warn!(error = %e, "durable backend unavailable; falling back to json files");
            }
        }

        let json_store = JsonFileStore::new(&base);
        match json_store.stats().await {
            Ok(_) => {
                info!(dir = %base.display(), backend = "json", "storage ready");
                return Arc::new(json_store);
            }
            Err(e) => {
                warn!(error = %e, "key-value backend unavailable; falling back to memory");
            }
        }
    } else {
        warn!(dir = %base.display(), "storage directory not writable; falling back to memory");
    }

    info!(backend = "memory", "storage ready");
    Arc::new(MemoryStore::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
