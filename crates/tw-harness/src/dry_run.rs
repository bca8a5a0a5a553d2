use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tw_core::config::DryRunConfig;

use crate::tool::{ToolCategory, ToolDefinition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DryRunError {
    #[error("DRY_RUN_BLOCKED: irreversible operation `{tool}` ({category}) refused")]
    Blocked { tool: String, category: String },
}

// ---------------------------------------------------------------------------
// SimulatedOperation
// ---------------------------------------------------------------------------

/// One intercepted side-effecting call, recorded instead of executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedOperation {
    pub category: ToolCategory,
    pub tool: String,
    /// Compact rendering of the input, truncated for the log.
    pub input_summary: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub reversible: bool,
}

/// Aggregated view of everything a dry run would have done.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunSummary {
    pub total: usize,
    pub by_category: HashMap<String, usize>,
    pub files_to_create: Vec<String>,
    pub files_to_delete: Vec<String>,
    pub commands: Vec<String>,
    pub irreversible_count: usize,
}

// ---------------------------------------------------------------------------
// DryRunManager
// ---------------------------------------------------------------------------

const INPUT_SUMMARY_MAX: usize = 200;

/// Intercepts side-effecting tool invocations and records what they would
/// have done. Orthogonal to the execution mode: the mode decides whether a
/// call is *permitted*, dry-run decides whether it is *performed*.
pub struct DryRunManager {
    enabled: bool,
    block_irreversible: bool,
    /// Empty set means every side-effecting category is intercepted.
    categories: HashSet<ToolCategory>,
    operations: Mutex<Vec<SimulatedOperation>>,
}

impl DryRunManager {
    pub fn new(config: &DryRunConfig) -> Self {
        let categories = config
            .categories
            .iter()
            .filter_map(|name| ToolCategory::from_name(name))
            .collect();
        Self {
            enabled: config.enabled,
            block_irreversible: config.block_irreversible,
            categories,
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&DryRunConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a call in this category should be simulated instead of run.
    pub fn intercepts(&self, category: ToolCategory) -> bool {
        if !self.enabled || !category.is_side_effecting() {
            return false;
        }
        self.categories.is_empty() || self.categories.contains(&category)
    }

    /// Record the simulated operation for an intercepted call. Fails with
    /// `DRY_RUN_BLOCKED` when irreversible operations are being refused.
    pub fn simulate(
        &self,
        definition: &ToolDefinition,
        input: &serde_json::Value,
    ) -> Result<SimulatedOperation, DryRunError> {
        let reversible = definition.is_reversible();
        if self.block_irreversible && !reversible {
            return Err(DryRunError::Blocked {
                tool: definition.name.clone(),
                category: definition.category.name().to_string(),
            });
        }

        let mut warnings = Vec::new();
        if !reversible {
            warnings.push(format!(
                "`{}` cannot be undone once executed for real",
                definition.name
            ));
        }

        let operation = SimulatedOperation {
            category: definition.category,
            tool: definition.name.clone(),
            input_summary: summarize_input(input),
            warnings,
            reversible,
        };

        debug!(tool = %operation.tool, category = %operation.category.name(), "recorded simulated operation");
        self.operations
            .lock()
            .expect("operations lock poisoned")
            .push(operation.clone());
        Ok(operation)
    }

    pub fn operations(&self) -> Vec<SimulatedOperation> {
        self.operations
            .lock()
            .expect("operations lock poisoned")
            .clone()
    }

    pub fn reset(&self) {
        self.operations
            .lock()
            .expect("operations lock poisoned")
            .clear();
    }

    /// Summarise everything recorded so far.
    pub fn summary(&self) -> DryRunSummary {
        let ops = self.operations.lock().expect("operations lock poisoned");
        let mut summary = DryRunSummary {
            total: ops.len(),
            ..Default::default()
        };
        for op in ops.iter() {
            *summary
                .by_category
                .entry(op.category.name().to_string())
                .or_insert(0) += 1;
            if !op.reversible {
                summary.irreversible_count += 1;
            }
            match op.category {
                ToolCategory::FileWrite => {
                    if let Some(path) = extract_path(&op.input_summary) {
                        summary.files_to_create.push(path);
                    }
                }
                ToolCategory::FileDelete => {
                    if let Some(path) = extract_path(&op.input_summary) {
                        summary.files_to_delete.push(path);
                    }
                }
                ToolCategory::ShellCommand => {
                    if let Some(cmd) = extract_command(&op.input_summary) {
                        summary.commands.push(cmd);
                    }
                }
                _ => {}
            }
        }
        summary
    }
}

fn summarize_input(input: &serde_json::Value) -> String {
    let mut rendered = input.to_string();
    if rendered.len() > INPUT_SUMMARY_MAX {
        let mut cut = INPUT_SUMMARY_MAX;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
        rendered.push('…');
    }
    rendered
}

fn extract_field(summary: &str, field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(summary).ok()?;
    value.get(field)?.as_str().map(String::from)
}

fn extract_path(summary: &str) -> Option<String> {
    extract_field(summary, "path")
}

fn extract_command(summary: &str) -> Option<String> {
    extract_field(summary, "command").or_else(|| extract_field(summary, "cmd"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enabled_manager(block_irreversible: bool) -> DryRunManager {
        DryRunManager::new(&DryRunConfig {
            enabled: true,
            block_irreversible,
            categories: Vec::new(),
        })
    }

    #[test]
    fn disabled_manager_intercepts_nothing() {
        let mgr = DryRunManager::disabled();
        assert!(!mgr.intercepts(ToolCategory::FileWrite));
        assert!(!mgr.intercepts(ToolCategory::ShellCommand));
    }

    #[test]
    fn enabled_manager_intercepts_side_effects_only() {
        let mgr = enabled_manager(false);
        assert!(mgr.intercepts(ToolCategory::FileWrite));
        assert!(mgr.intercepts(ToolCategory::Network));
        assert!(!mgr.intercepts(ToolCategory::FileRead));
        assert!(!mgr.intercepts(ToolCategory::Analysis));
    }

    #[test]
    fn category_filter_narrows_interception() {
        let mgr = DryRunManager::new(&DryRunConfig {
            enabled: true,
            block_irreversible: false,
            categories: vec!["file_write".into()],
        });
        assert!(mgr.intercepts(ToolCategory::FileWrite));
        assert!(!mgr.intercepts(ToolCategory::ShellCommand));
    }

    #[test]
    fn simulate_records_operation() {
        let mgr = enabled_manager(false);
        let def = ToolDefinition::new("write_file", "Write", ToolCategory::FileWrite);
        let op = mgr
            .simulate(&def, &json!({"path": "src/new.rs", "content": "fn x() {}"}))
            .unwrap();

        assert_eq!(op.tool, "write_file");
        assert!(op.reversible);
        assert!(op.warnings.is_empty());
        assert_eq!(mgr.operations().len(), 1);
    }

    #[test]
    fn irreversible_op_warns_or_blocks() {
        let def = ToolDefinition::new("rm", "Delete", ToolCategory::FileDelete);

        let permissive = enabled_manager(false);
        let op = permissive.simulate(&def, &json!({"path": "old.rs"})).unwrap();
        assert!(!op.reversible);
        assert_eq!(op.warnings.len(), 1);

        let blocking = enabled_manager(true);
        let err = blocking.simulate(&def, &json!({"path": "old.rs"})).unwrap_err();
        assert!(err.to_string().contains("DRY_RUN_BLOCKED"));
        assert!(blocking.operations().is_empty());
    }

    #[test]
    fn summary_aggregates_by_category() {
        let mgr = enabled_manager(false);
        mgr.simulate(
            &ToolDefinition::new("write_file", "w", ToolCategory::FileWrite),
            &json!({"path": "a.rs"}),
        )
        .unwrap();
        mgr.simulate(
            &ToolDefinition::new("write_file", "w", ToolCategory::FileWrite),
            &json!({"path": "b.rs"}),
        )
        .unwrap();
        mgr.simulate(
            &ToolDefinition::new("delete_file", "d", ToolCategory::FileDelete),
            &json!({"path": "c.rs"}),
        )
        .unwrap();
        mgr.simulate(
            &ToolDefinition::new("shell", "s", ToolCategory::ShellCommand),
            &json!({"command": "cargo fmt"}),
        )
        .unwrap();

        let summary = mgr.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_category["file_write"], 2);
        assert_eq!(summary.files_to_create, vec!["a.rs", "b.rs"]);
        assert_eq!(summary.files_to_delete, vec!["c.rs"]);
        assert_eq!(summary.commands, vec!["cargo fmt"]);
        assert_eq!(summary.irreversible_count, 2);
    }

    #[test]
    fn long_input_is_truncated_in_summary() {
        let mgr = enabled_manager(false);
        let big = "x".repeat(1_000);
        let op = mgr
            .simulate(
                &ToolDefinition::new("write_file", "w", ToolCategory::FileWrite),
                &json!({"path": "big.rs", "content": big}),
            )
            .unwrap();
        assert!(op.input_summary.len() <= INPUT_SUMMARY_MAX + '…'.len_utf8());
    }

    #[test]
    fn reset_clears_recorded_operations() {
        let mgr = enabled_manager(false);
        mgr.simulate(
            &ToolDefinition::new("write_file", "w", ToolCategory::FileWrite),
            &json!({"path": "a.rs"}),
        )
        .unwrap();
        mgr.reset();
        assert!(mgr.operations().is_empty());
        assert_eq!(mgr.summary().total, 0);
    }
}
