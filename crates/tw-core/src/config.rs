use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration, loaded from `~/.taskweave/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load from `~/.taskweave/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize to TOML for diagnostics.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskweave")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker pool size for sub-task graphs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-sub-task timeout.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Cap on chained decompositions.
    #[serde(default = "default_max_depth")]
    pub max_decomposition_depth: u32,
    /// Abort the remaining levels when a sub-task fails.
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_ms: default_task_timeout_ms(),
            max_decomposition_depth: default_max_depth(),
            continue_on_error: default_continue_on_error(),
        }
    }
}

fn default_max_concurrency() -> usize {
    3
}
fn default_task_timeout_ms() -> u64 {
    120_000
}
fn default_max_depth() -> u32 {
    5
}
fn default_continue_on_error() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Upper bound on tool calls running in parallel inside one agent turn.
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
    /// Timeout applied to tools with no category default.
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_parallel_tools: default_max_parallel_tools(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

fn default_max_parallel_tools() -> usize {
    4
}
fn default_fallback_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Failure rate over the sliding window that also opens the circuit.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Size of the sliding outcome window.
    #[serde(default = "default_window")]
    pub window: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            failure_rate_threshold: default_failure_rate_threshold(),
            window: default_window(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    60_000
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_window() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,
    /// Progress delta (0.0..=1.0) that triggers a snapshot.
    #[serde(default = "default_progress_threshold")]
    pub progress_threshold: f64,
    /// Token-usage growth that triggers a snapshot.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkpoint_interval_ms(),
            progress_threshold: default_progress_threshold(),
            token_threshold: default_token_threshold(),
        }
    }
}

fn default_checkpoint_interval_ms() -> u64 {
    30_000
}
fn default_progress_threshold() -> f64 {
    0.10
}
fn default_token_threshold() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_task_retention_ms")]
    pub task_ms: u64,
    #[serde(default = "default_checkpoint_retention_ms")]
    pub checkpoint_ms: u64,
    #[serde(default = "default_dlq_retention_ms")]
    pub dlq_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            task_ms: default_task_retention_ms(),
            checkpoint_ms: default_checkpoint_retention_ms(),
            dlq_ms: default_dlq_retention_ms(),
        }
    }
}

fn default_task_retention_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}
fn default_checkpoint_retention_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_dlq_retention_ms() -> u64 {
    24 * 60 * 60 * 1000
}

/// Which tool operations are permitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Read-like operations only; writes, shell, and network are denied.
    Plan,
    /// Everything permitted.
    #[default]
    Execute,
    /// Side-effecting operations wait for an approval callback.
    Strict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub block_irreversible: bool,
    /// Category names to intercept; empty means every side-effect category.
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the durable and key-value backends.
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

fn default_storage_dir() -> String {
    "~/.taskweave/store".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.orchestrator.max_concurrency, 3);
        assert_eq!(cfg.orchestrator.task_timeout_ms, 120_000);
        assert_eq!(cfg.orchestrator.max_decomposition_depth, 5);
        assert!(cfg.orchestrator.continue_on_error);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.circuit.cooldown_ms, 60_000);
        assert_eq!(cfg.checkpoint.interval_ms, 30_000);
        assert!((cfg.checkpoint.progress_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.checkpoint.token_threshold, 10_000);
        assert_eq!(cfg.retention.task_ms, 604_800_000);
        assert_eq!(cfg.retention.checkpoint_ms, 86_400_000);
        assert_eq!(cfg.retention.dlq_ms, 86_400_000);
        assert_eq!(cfg.execution.mode, ExecutionMode::Execute);
        assert!(!cfg.dry_run.enabled);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.orchestrator.max_concurrency, 3);
        assert_eq!(back.execution.mode, ExecutionMode::Execute);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let text = r#"
            [orchestrator]
            max_concurrency = 8

            [execution]
            mode = "strict"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.orchestrator.max_concurrency, 8);
        assert_eq!(cfg.orchestrator.task_timeout_ms, 120_000);
        assert_eq!(cfg.execution.mode, ExecutionMode::Strict);
        assert_eq!(cfg.circuit.failure_threshold, 5);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[circuit]\nfailure_threshold = 9\n").unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.circuit.failure_threshold, 9);
    }

    #[test]
    fn load_from_missing_file_errors() {
        let err = Config::load_from("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_from_bad_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not toml at all [[[").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
