use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use tw_core::config::ToolsConfig;
use tw_core::{ToolCall, ToolResult};

use crate::dry_run::DryRunManager;
use crate::mode_guard::{ApprovalCallback, ExecutionModeGuard};
use crate::registry::ToolRegistry;
use crate::tool::ToolHandler;

// ---------------------------------------------------------------------------
// Config / observers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on tool calls in flight at once in parallel mode.
    pub max_parallel_tools: usize,
    /// Timeout for fallback-routed calls, which have no category.
    pub fallback_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tools: 4,
            fallback_timeout_ms: 30_000,
        }
    }
}

impl From<&ToolsConfig> for ExecutorConfig {
    fn from(cfg: &ToolsConfig) -> Self {
        Self {
            max_parallel_tools: cfg.max_parallel_tools,
            fallback_timeout_ms: cfg.fallback_timeout_ms,
        }
    }
}

/// Best-effort observation hooks around each tool call. Implementations must
/// not block; delivery failures are the observer's problem, never the
/// caller's.
pub trait ToolObserver: Send + Sync {
    fn on_tool_call(&self, _call: &ToolCall) {}
    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}
    fn on_tool_error(&self, _call: &ToolCall, _error: &str) {}
}

// ---------------------------------------------------------------------------
// ToolExecutor
// ---------------------------------------------------------------------------

/// Runs batches of tool calls through the registry with per-tool timeouts,
/// mode-guard permission checks, and dry-run interception.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    guard: Arc<ExecutionModeGuard>,
    dry_run: Arc<DryRunManager>,
    approval: Option<Arc<dyn ApprovalCallback>>,
    fallback: Option<Arc<dyn ToolHandler>>,
    observers: Vec<Arc<dyn ToolObserver>>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        guard: Arc<ExecutionModeGuard>,
        dry_run: Arc<DryRunManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            dry_run,
            approval: None,
            fallback: None,
            observers: Vec::new(),
            config,
        }
    }

    pub fn with_approval_callback(mut self, callback: Arc<dyn ApprovalCallback>) -> Self {
        self.approval = Some(callback);
        self
    }

    /// Route calls to unregistered tool names through this handler.
    pub fn with_fallback_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ToolObserver>) {
        self.observers.push(observer);
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call. All failure paths come back as error results;
    /// nothing propagates as `Err` into the agent loop.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        for obs in &self.observers {
            obs.on_tool_call(call);
        }

        let started = std::time::Instant::now();
        let mut result = self.execute_inner(call).await;
        result.execution_time_ms = Some(started.elapsed().as_millis() as u64);

        for obs in &self.observers {
            if result.is_error {
                if let Some(error) = &result.error {
                    obs.on_tool_error(call, error);
                }
            }
            obs.on_tool_result(call, &result);
        }
        result
    }

    async fn execute_inner(&self, call: &ToolCall) -> ToolResult {
        let Some(definition) = self.registry.definition(&call.name) else {
            return self.execute_fallback(call).await;
        };

        if definition.category.is_side_effecting() {
            let permission = self.guard.check_permission(definition.category, &call.input);
            if !permission.allowed {
                let reason = permission.reason.unwrap_or_else(|| "denied".into());
                warn!(tool = %call.name, %reason, "tool call denied by execution mode");
                return ToolResult::err(&call.id, reason);
            }
            if permission.needs_approval {
                let approved = self
                    .guard
                    .await_approval(
                        self.approval.as_deref(),
                        &call.name,
                        definition.category,
                        &call.input,
                    )
                    .await;
                if !approved {
                    return ToolResult::err(
                        &call.id,
                        format!("approval denied for `{}`", call.name),
                    );
                }
            }

            if self.dry_run.intercepts(definition.category) {
                return match self.dry_run.simulate(&definition, &call.input) {
                    Ok(op) => ToolResult::ok(
                        &call.id,
                        serde_json::json!({
                            "dry_run": true,
                            "tool": op.tool,
                            "category": op.category.name(),
                            "reversible": op.reversible,
                        }),
                    ),
                    Err(e) => ToolResult::err(&call.id, e.to_string()),
                };
            }
        }

        let timeout = Duration::from_millis(definition.effective_timeout_ms());
        match tokio::time::timeout(timeout, self.registry.execute(&call.name, call.input.clone()))
            .await
        {
            Ok(outcome) if outcome.success => ToolResult::ok(&call.id, outcome.output),
            Ok(outcome) => ToolResult::err(
                &call.id,
                format!(
                    "TOOL_HANDLER_ERROR: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".into())
                ),
            ),
            Err(_) => {
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool call timed out");
                ToolResult::err(
                    &call.id,
                    format!(
                        "TOOL_TIMEOUT: `{}` exceeded {}ms",
                        call.name,
                        timeout.as_millis()
                    ),
                )
            }
        }
    }

    async fn execute_fallback(&self, call: &ToolCall) -> ToolResult {
        let Some(fallback) = &self.fallback else {
            return ToolResult::err(&call.id, format!("tool not registered: {}", call.name));
        };
        debug!(tool = %call.name, "routing unregistered tool to fallback handler");

        let timeout = Duration::from_millis(self.config.fallback_timeout_ms);
        match tokio::time::timeout(timeout, fallback.execute(call.input.clone())).await {
            Ok(Ok(output)) => ToolResult::ok(&call.id, output),
            Ok(Err(e)) => ToolResult::err(&call.id, format!("TOOL_HANDLER_ERROR: {e}")),
            Err(_) => ToolResult::err(
                &call.id,
                format!(
                    "TOOL_TIMEOUT: fallback `{}` exceeded {}ms",
                    call.name,
                    timeout.as_millis()
                ),
            ),
        }
    }

    /// Execute a batch of calls, preserving input order in the output.
    ///
    /// In parallel mode at most `max_parallel_tools` calls run at once; in
    /// sequential mode calls run one after another.
    pub async fn execute_all(self: &Arc<Self>, calls: &[ToolCall], parallel: bool) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        if !parallel || calls.len() == 1 {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute(call).await);
            }
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tools.max(1)));
        let mut handles = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().cloned().enumerate() {
            let executor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                (index, executor.execute(&call).await)
            }));
        }

        let mut results: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();
        for handle in handles {
            match handle.await {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "tool task join error"),
            }
        }
        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| ToolResult::err(&calls[i].id, "tool task panicked"))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisterOptions;
    use crate::tool::{FnHandler, ToolCategory, ToolDefinition, ToolError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tw_core::config::DryRunConfig;
    use tw_core::ExecutionMode;

    fn call(id: &str, name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn registry_with_echo() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("echo", "Echo input", ToolCategory::Analysis),
                Arc::new(FnHandler::sync(|input| Ok(json!({ "echoed": input })))),
                RegisterOptions::default(),
            )
            .unwrap();
        registry
    }

    fn executor(registry: Arc<ToolRegistry>, mode: ExecutionMode) -> Arc<ToolExecutor> {
        Arc::new(ToolExecutor::new(
            registry,
            Arc::new(ExecutionModeGuard::new(mode)),
            Arc::new(DryRunManager::disabled()),
            ExecutorConfig::default(),
        ))
    }

    #[tokio::test]
    async fn execute_returns_output_and_duration() {
        let exec = executor(registry_with_echo(), ExecutionMode::Execute);
        let result = exec.execute(&call("c1", "echo", json!({"x": 1}))).await;

        assert!(!result.is_error);
        assert_eq!(result.tool_call_id, "c1");
        assert_eq!(result.output["echoed"]["x"], 1);
        assert!(result.execution_time_ms.is_some());
    }

    #[tokio::test]
    async fn unregistered_tool_without_fallback_fails() {
        let exec = executor(registry_with_echo(), ExecutionMode::Execute);
        let result = exec.execute(&call("c1", "mystery", json!({}))).await;
        assert!(result.is_error);
        assert!(result.error.unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn fallback_handler_receives_unregistered_calls() {
        let registry = registry_with_echo();
        let guard = Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute));
        let exec = Arc::new(
            ToolExecutor::new(
                registry,
                guard,
                Arc::new(DryRunManager::disabled()),
                ExecutorConfig::default(),
            )
            .with_fallback_handler(Arc::new(FnHandler::sync(|_| Ok(json!("from fallback"))))),
        );

        let result = exec.execute(&call("c1", "mystery", json!({}))).await;
        assert!(!result.is_error);
        assert_eq!(result.output, json!("from fallback"));
    }

    #[tokio::test]
    async fn timeout_yields_distinguishable_error() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("slow", "Sleeps", ToolCategory::Analysis).with_timeout_ms(20),
                Arc::new(FnHandler::new(|_input| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ToolError>(json!("late"))
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let exec = executor(registry, ExecutionMode::Execute);
        let result = exec.execute(&call("c1", "slow", json!({}))).await;
        assert!(result.is_error);
        assert!(result.error.unwrap().starts_with("TOOL_TIMEOUT"));
    }

    #[tokio::test]
    async fn plan_mode_blocks_side_effecting_tools() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("write_file", "Write", ToolCategory::FileWrite),
                Arc::new(FnHandler::sync(|_| Ok(json!("wrote")))),
                RegisterOptions::default(),
            )
            .unwrap();

        let exec = executor(registry, ExecutionMode::Plan);
        let result = exec
            .execute(&call("c1", "write_file", json!({"path": "a.rs"})))
            .await;
        assert!(result.is_error);
        assert!(result.error.unwrap().contains("plan mode"));
    }

    #[tokio::test]
    async fn dry_run_simulates_instead_of_executing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("write_file", "Write", ToolCategory::FileWrite),
                Arc::new(FnHandler::sync(move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("wrote"))
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let dry_run = Arc::new(DryRunManager::new(&DryRunConfig {
            enabled: true,
            block_irreversible: false,
            categories: Vec::new(),
        }));
        let exec = Arc::new(ToolExecutor::new(
            registry,
            Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute)),
            Arc::clone(&dry_run),
            ExecutorConfig::default(),
        ));

        let result = exec
            .execute(&call("c1", "write_file", json!({"path": "a.rs"})))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.output["dry_run"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "handler must not run");
        assert_eq!(dry_run.operations().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_blocks_irreversible_when_configured() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("delete_file", "Delete", ToolCategory::FileDelete),
                Arc::new(FnHandler::sync(|_| Ok(json!("deleted")))),
                RegisterOptions::default(),
            )
            .unwrap();

        let dry_run = Arc::new(DryRunManager::new(&DryRunConfig {
            enabled: true,
            block_irreversible: true,
            categories: Vec::new(),
        }));
        let exec = Arc::new(ToolExecutor::new(
            registry,
            Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute)),
            dry_run,
            ExecutorConfig::default(),
        ));

        let result = exec
            .execute(&call("c1", "delete_file", json!({"path": "a.rs"})))
            .await;
        assert!(result.is_error);
        assert!(result.error.unwrap().contains("DRY_RUN_BLOCKED"));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let exec = executor(registry_with_echo(), ExecutionMode::Execute);
        let calls: Vec<ToolCall> = (0..6)
            .map(|i| call(&format!("c{i}"), "echo", json!({"i": i})))
            .collect();

        let results = exec.execute_all(&calls, true).await;
        assert_eq!(results.len(), 6);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.tool_call_id, format!("c{i}"));
            assert_eq!(result.output["echoed"]["i"], i);
        }
    }

    #[tokio::test]
    async fn parallel_mode_bounds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_c, peak_c) = (Arc::clone(&current), Arc::clone(&peak));

        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("probe", "Tracks concurrency", ToolCategory::Analysis),
                Arc::new(FnHandler::new(move |_input| {
                    let current = Arc::clone(&current_c);
                    let peak = Arc::clone(&peak_c);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ToolError>(json!("done"))
                    }
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let exec = Arc::new(ToolExecutor::new(
            registry,
            Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute)),
            Arc::new(DryRunManager::disabled()),
            ExecutorConfig {
                max_parallel_tools: 2,
                fallback_timeout_ms: 30_000,
            },
        ));

        let calls: Vec<ToolCall> = (0..8)
            .map(|i| call(&format!("c{i}"), "probe", json!({})))
            .collect();
        let results = exec.execute_all(&calls, true).await;

        assert!(results.iter().all(|r| !r.is_error));
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak concurrency exceeded bound");
    }

    #[tokio::test]
    async fn observers_see_calls_and_errors() {
        struct Counting {
            calls: AtomicUsize,
            errors: AtomicUsize,
        }
        impl ToolObserver for Counting {
            fn on_tool_call(&self, _c: &ToolCall) {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
            fn on_tool_error(&self, _c: &ToolCall, _e: &str) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        let observer = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let mut exec = ToolExecutor::new(
            registry_with_echo(),
            Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute)),
            Arc::new(DryRunManager::disabled()),
            ExecutorConfig::default(),
        );
        exec.add_observer(observer.clone() as Arc<dyn ToolObserver>);
        let exec = Arc::new(exec);

        exec.execute(&call("c1", "echo", json!({}))).await;
        exec.execute(&call("c2", "missing", json!({}))).await;

        assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
    }
}
