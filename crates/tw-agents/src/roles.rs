use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tw_core::AgentKind;
use tw_harness::capabilities::{
    Analysis, CapabilityError, Shell, WritableFileSystem,
};
use tw_harness::ToolCategory;

// ---------------------------------------------------------------------------
// RoleProfile
// ---------------------------------------------------------------------------

/// Static configuration of one agent kind: which tool categories it may use,
/// how long it may loop, and how its prompt is pitched.
#[derive(Debug, Clone)]
pub struct RoleProfile {
    pub kind: AgentKind,
    pub description: &'static str,
    pub system_prompt: String,
    pub allowed_categories: Vec<ToolCategory>,
    pub read_only: bool,
    pub max_steps: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Restore file snapshots when post-run verification fails.
    pub rollback_on_failure: bool,
}

impl RoleProfile {
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Explore => Self {
                kind,
                description: "Searches and reads the codebase without modifying anything",
                system_prompt: "You explore codebases. Use read-only tools to find files, \
                                read code, and summarise what you learn."
                    .into(),
                allowed_categories: vec![ToolCategory::FileRead, ToolCategory::Analysis],
                read_only: true,
                max_steps: 12,
                max_tokens: 4_096,
                temperature: 0.2,
                rollback_on_failure: false,
            },
            AgentKind::Architect => Self {
                kind,
                description: "Produces designs and long-form technical plans",
                system_prompt: "You are a software architect. Read the relevant code and \
                                produce a thorough design. You never modify files."
                    .into(),
                allowed_categories: vec![ToolCategory::FileRead, ToolCategory::Analysis],
                read_only: true,
                max_steps: 12,
                max_tokens: 16_384,
                temperature: 0.8,
                rollback_on_failure: false,
            },
            AgentKind::Coder => Self {
                kind,
                description: "Implements features and edits source files",
                system_prompt: "You write code. Read what you need, then create or edit \
                                files to complete the task."
                    .into(),
                allowed_categories: vec![
                    ToolCategory::FileRead,
                    ToolCategory::FileWrite,
                    ToolCategory::FileDelete,
                    ToolCategory::Analysis,
                ],
                read_only: false,
                max_steps: 24,
                max_tokens: 8_192,
                temperature: 0.3,
                rollback_on_failure: false,
            },
            AgentKind::Fixer => Self {
                kind,
                description: "Applies targeted fixes and verifies them",
                system_prompt: "You fix bugs. Make the smallest change that resolves the \
                                problem, then verify it."
                    .into(),
                allowed_categories: vec![
                    ToolCategory::FileRead,
                    ToolCategory::FileWrite,
                    ToolCategory::Analysis,
                    ToolCategory::Test,
                ],
                read_only: false,
                max_steps: 16,
                max_tokens: 8_192,
                temperature: 0.2,
                rollback_on_failure: true,
            },
            AgentKind::Reviewer => Self {
                kind,
                description: "Reviews code and reports issues",
                system_prompt: "You review code for correctness, clarity, and risk. Report \
                                concrete issues with file and line references."
                    .into(),
                allowed_categories: vec![ToolCategory::FileRead, ToolCategory::Analysis],
                read_only: true,
                max_steps: 12,
                max_tokens: 8_192,
                temperature: 0.2,
                rollback_on_failure: false,
            },
            AgentKind::Tester => Self {
                kind,
                description: "Runs test suites and reports results",
                system_prompt: "You run tests. Detect the framework, run the relevant \
                                suites, and report failures precisely."
                    .into(),
                allowed_categories: vec![ToolCategory::FileRead, ToolCategory::Test],
                read_only: false,
                max_steps: 10,
                max_tokens: 4_096,
                temperature: 0.1,
                rollback_on_failure: false,
            },
            AgentKind::Builder => Self {
                kind,
                description: "Runs build commands and manages processes",
                system_prompt: "You run builds and shell commands. Track what you start so \
                                it can be stopped."
                    .into(),
                allowed_categories: vec![
                    ToolCategory::FileRead,
                    ToolCategory::ShellCommand,
                    ToolCategory::PackageInstall,
                    ToolCategory::ServerStart,
                    ToolCategory::ServerStop,
                ],
                read_only: false,
                max_steps: 16,
                max_tokens: 4_096,
                temperature: 0.1,
                rollback_on_failure: false,
            },
            AgentKind::Deployer => Self {
                kind,
                description: "Ships builds to their targets",
                system_prompt: "You deploy software. Follow the project's release process \
                                and stop on anything suspicious."
                    .into(),
                allowed_categories: vec![
                    ToolCategory::FileRead,
                    ToolCategory::ShellCommand,
                    ToolCategory::GitOperation,
                    ToolCategory::ServerStart,
                    ToolCategory::ServerStop,
                    ToolCategory::Network,
                ],
                read_only: false,
                max_steps: 16,
                max_tokens: 4_096,
                temperature: 0.1,
                rollback_on_failure: false,
            },
        }
    }

    pub fn allows(&self, category: ToolCategory) -> bool {
        self.allowed_categories.contains(&category)
    }
}

// ---------------------------------------------------------------------------
// FileSnapshotSet -- coder/fixer rollback support
// ---------------------------------------------------------------------------

/// Pre-run snapshots of the files a task references. `restore` puts every
/// snapshotted file back and deletes files that did not exist before the run.
pub struct FileSnapshotSet {
    /// path -> contents before the run, or None when the file did not exist.
    entries: HashMap<String, Option<String>>,
}

impl FileSnapshotSet {
    pub async fn capture(
        fs: &dyn WritableFileSystem,
        paths: &[String],
    ) -> Result<Self, CapabilityError> {
        let mut entries = HashMap::new();
        for path in paths {
            let snapshot = if fs.exists(path).await? {
                Some(fs.read_file(path).await?)
            } else {
                None
            };
            entries.insert(path.clone(), snapshot);
        }
        debug!(files = entries.len(), "captured file snapshots");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restore every snapshot. Returns the number of files touched.
    pub async fn restore(&self, fs: &dyn WritableFileSystem) -> Result<usize, CapabilityError> {
        let mut restored = 0;
        for (path, snapshot) in &self.entries {
            match snapshot {
                Some(content) => {
                    fs.write_file(path, content).await?;
                    restored += 1;
                }
                None => {
                    if fs.exists(path).await? {
                        fs.delete(path).await?;
                        restored += 1;
                    }
                }
            }
        }
        info!(files = restored, "restored file snapshots");
        Ok(restored)
    }
}

// ---------------------------------------------------------------------------
// ReviewMemo -- bounded LRU with TTL for analysis results
// ---------------------------------------------------------------------------

struct MemoEntry {
    analysis: Analysis,
    inserted: Instant,
}

/// Memoises reviewer analyses by `(path, content-hash)` so unchanged files
/// are not re-analysed within the TTL.
pub struct ReviewMemo {
    cache: Mutex<LruCache<(String, String), MemoEntry>>,
    ttl: Duration,
}

impl ReviewMemo {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, path: &str, content: &str) -> Option<Analysis> {
        let key = (path.to_string(), Self::content_hash(content));
        let mut cache = self.cache.lock().await;
        match cache.get(&key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.analysis.clone()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, path: &str, content: &str, analysis: Analysis) {
        let key = (path.to_string(), Self::content_hash(content));
        let mut cache = self.cache.lock().await;
        cache.put(
            key,
            MemoEntry {
                analysis,
                inserted: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

impl Default for ReviewMemo {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(10 * 60))
    }
}

// ---------------------------------------------------------------------------
// TestHistory -- bounded record of test runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub success: bool,
    pub summary: String,
}

/// Bounded history of test outcomes observed by the tester agent.
pub struct TestHistory {
    records: Mutex<Vec<TestRecord>>,
    capacity: usize,
}

impl TestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, success: bool, summary: impl Into<String>) {
        let mut records = self.records.lock().await;
        records.push(TestRecord {
            success,
            summary: summary.into(),
        });
        let overflow = records.len().saturating_sub(self.capacity);
        if overflow > 0 {
            records.drain(..overflow);
        }
    }

    pub async fn records(&self) -> Vec<TestRecord> {
        self.records.lock().await.clone()
    }
}

impl Default for TestHistory {
    fn default() -> Self {
        Self::new(50)
    }
}

// ---------------------------------------------------------------------------
// CommandLog -- builder's executed-command tracking
// ---------------------------------------------------------------------------

/// Tracks shell commands the builder ran and stops anything still running.
pub struct CommandLog {
    commands: Mutex<Vec<String>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }

    pub async fn record(&self, command: impl Into<String>) {
        self.commands.lock().await.push(command.into());
    }

    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    /// Kill every process the shell still reports as running. Returns the
    /// number of processes stopped.
    pub async fn stop_all_processes(&self, shell: &dyn Shell) -> Result<usize, CapabilityError> {
        let processes = shell.running_processes().await?;
        let mut stopped = 0;
        for process in processes {
            shell.kill(process.id).await?;
            stopped += 1;
        }
        if stopped > 0 {
            info!(count = stopped, "stopped running processes");
        }
        Ok(stopped)
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
