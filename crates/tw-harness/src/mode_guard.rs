use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tw_core::ExecutionMode;

use crate::tool::ToolCategory;

// ---------------------------------------------------------------------------
// Permission
// ---------------------------------------------------------------------------

/// Outcome of a permission check against the current execution mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub allowed: bool,
    pub needs_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Permission {
    fn granted() -> Self {
        Self {
            allowed: true,
            needs_approval: false,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            needs_approval: false,
            reason: Some(reason.into()),
        }
    }

    fn pending_approval(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            needs_approval: true,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalCallback
// ---------------------------------------------------------------------------

/// Host-provided hook awaited before a side-effecting tool runs in strict
/// mode. The answer is awaited synchronously with the call.
#[async_trait::async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn approve(
        &self,
        tool_name: &str,
        category: ToolCategory,
        input: &serde_json::Value,
    ) -> bool;
}

// ---------------------------------------------------------------------------
// ExecutionModeGuard
// ---------------------------------------------------------------------------

/// Plan/execute/strict policy over tool operations.
///
/// Mode changes are logged but not retroactive: calls already past their
/// permission check proceed under the mode they were checked with.
pub struct ExecutionModeGuard {
    mode: RwLock<ExecutionMode>,
}

impl ExecutionModeGuard {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        *self.mode.read().expect("mode lock poisoned")
    }

    pub fn set_mode(&self, mode: ExecutionMode) {
        let mut guard = self.mode.write().expect("mode lock poisoned");
        if *guard != mode {
            info!(from = ?*guard, to = ?mode, "execution mode changed");
            *guard = mode;
        }
    }

    /// Check whether an operation in `category` is permitted. Read-like
    /// operations pass in every mode; side-effecting operations are denied in
    /// plan mode and flagged for approval in strict mode.
    pub fn check_permission(&self, category: ToolCategory, _input: &serde_json::Value) -> Permission {
        if !category.is_side_effecting() {
            return Permission::granted();
        }
        match self.mode() {
            ExecutionMode::Execute => Permission::granted(),
            ExecutionMode::Plan => Permission::denied(format!(
                "{} operations are not permitted in plan mode",
                category.name()
            )),
            ExecutionMode::Strict => Permission::pending_approval(format!(
                "{} operations require approval in strict mode",
                category.name()
            )),
        }
    }

    /// Resolve a `needs_approval` permission by awaiting the callback. A
    /// missing callback counts as a denial.
    pub async fn await_approval(
        &self,
        callback: Option<&dyn ApprovalCallback>,
        tool_name: &str,
        category: ToolCategory,
        input: &serde_json::Value,
    ) -> bool {
        match callback {
            Some(cb) => {
                let approved = cb.approve(tool_name, category, input).await;
                if !approved {
                    warn!(tool = tool_name, "approval denied");
                }
                approved
            }
            None => {
                warn!(
                    tool = tool_name,
                    "strict mode with no approval callback; denying"
                );
                false
            }
        }
    }
}

impl Default for ExecutionModeGuard {
    fn default() -> Self {
        Self::new(ExecutionMode::Execute)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
