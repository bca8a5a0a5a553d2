//! The orchestrator: decides whether to answer a task directly, delegate it
//! to one specialised agent, or decompose it into a dependency graph of
//! sub-tasks, then drives the parallel executor, circuit breakers,
//! checkpoint scheduler, and dead-letter queue around that decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tw_agents::{AgentRegistry, DecisionOracle, OracleReply};
use tw_core::{
    AgentKind, AgentMessage, Checkpoint, CheckpointReason, Config, Decision, ErrorCode, EventBus,
    RuntimeEvent, SubTaskDraft, SubTaskSpec, Task, TaskContext, TaskError, TaskResult, TaskStatus,
};
use tw_harness::{BreakerRegistry, CircuitState, ToolCategory, ToolDefinition};
use tw_storage::TaskStore;

use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointScheduler, StateProvider};
use crate::dead_letter::{DeadLetterQueue, DlqError};
use crate::parallel::{
    ExecutionReport, ParallelConfig, ParallelExecutor, SubTaskRunner, SubTaskStatus,
};
use crate::routing_cache::RoutingCache;

const MAX_SUBTASKS: usize = 20;

const ORCHESTRATOR_SYSTEM_PROMPT: &str = "You are a task orchestrator. Analyse the task and \
either answer it directly, delegate it to one of the available agents with delegate_to_agent, \
split it into sub-tasks with create_subtasks, ask the user a clarifying question with ask_user, \
or finish with complete_task.";

// ---------------------------------------------------------------------------
// Orchestration tool definitions (what the decision oracle may call)
// ---------------------------------------------------------------------------

fn orchestration_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "delegate_to_agent",
            "Hand the task to a single specialised agent.",
            ToolCategory::Analysis,
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": ["explore", "coder", "builder", "tester", "deployer", "reviewer", "fixer", "architect"],
                    "description": "Which agent should handle the task"
                },
                "task": { "type": "string", "description": "What the agent should do" }
            },
            "required": ["agent", "task"]
        })),
        ToolDefinition::new(
            "create_subtasks",
            "Split the task into sub-tasks with optional dependencies.",
            ToolCategory::Analysis,
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "sub_tasks": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_SUBTASKS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent": { "type": "string" },
                            "description": { "type": "string" },
                            "depends_on": {
                                "type": "array",
                                "items": { "type": "integer", "minimum": 0 },
                                "description": "Indexes of earlier sub-tasks this one needs"
                            }
                        },
                        "required": ["agent", "description"]
                    }
                },
                "reasoning": { "type": "string" }
            },
            "required": ["sub_tasks"]
        })),
        ToolDefinition::new(
            "ask_user",
            "Ask the user a clarifying question before proceeding.",
            ToolCategory::Analysis,
        )
        .with_schema(json!({
            "type": "object",
            "properties": { "question": { "type": "string" } },
            "required": ["question"]
        })),
        ToolDefinition::new(
            "complete_task",
            "Mark the task complete with a final result.",
            ToolCategory::Analysis,
        )
        .with_schema(json!({
            "type": "object",
            "properties": { "result": { "type": "string" } },
            "required": ["result"]
        })),
    ]
}

// ---------------------------------------------------------------------------
// State provider for the checkpoint scheduler
// ---------------------------------------------------------------------------

struct TaskStateProvider {
    task: Arc<Mutex<Task>>,
    /// Latest delegated agent conversation, copied into every snapshot.
    history: Arc<Mutex<Vec<AgentMessage>>>,
}

#[async_trait::async_trait]
impl StateProvider for TaskStateProvider {
    async fn capture(&self, reason: CheckpointReason) -> Checkpoint {
        let task = self.task.lock().await;
        let history = self.history.lock().await.clone();
        Checkpoint::new(&task, reason).with_history(history)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Config,
    oracle: Arc<dyn DecisionOracle>,
    agents: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn TaskStore>,
    checkpoints: Arc<CheckpointScheduler>,
    dlq: Arc<DeadLetterQueue>,
    routing: RoutingCache,
    /// Agent-registry generation the routing cache was last valid for.
    routing_generation: AtomicU64,
    event_bus: EventBus,
    cancel_tokens: DashMap<String, CancelToken>,
    /// Whether the host wired in a web-search capability; advertised in the
    /// analysis prompt so the oracle can plan around it.
    web_search_available: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        oracle: Arc<dyn DecisionOracle>,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn TaskStore>,
        event_bus: EventBus,
    ) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.circuit.clone()));
        let checkpoints = Arc::new(CheckpointScheduler::new(
            Arc::clone(&store),
            config.checkpoint.clone(),
            event_bus.clone(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            Arc::clone(&store),
            config.retention.dlq_ms,
            event_bus.clone(),
            Arc::clone(&breakers),
        ));
        Self {
            config,
            oracle,
            agents,
            breakers,
            store,
            checkpoints,
            dlq,
            routing: RoutingCache::default(),
            routing_generation: AtomicU64::new(0),
            event_bus,
            cancel_tokens: DashMap::new(),
            web_search_available: false,
        }
    }

    pub fn with_web_search_available(mut self, available: bool) -> Self {
        self.web_search_available = available;
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointScheduler> {
        &self.checkpoints
    }

    pub fn dead_letter_queue(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Public entry points
    // -----------------------------------------------------------------------

    /// Drive one task to a terminal state. The returned result is also
    /// recorded on the persisted task.
    pub async fn execute(&self, mut task: Task) -> TaskResult {
        let task_id = task.id.clone();

        if task.is_terminal() {
            return TaskResult::err(TaskError::new(
                ErrorCode::Validation,
                format!("task `{task_id}` is already terminal"),
            ));
        }
        if task.status == TaskStatus::Pending {
            let _ = task.enqueue();
            self.event_bus.publish(RuntimeEvent::TaskQueued {
                task_id: task_id.clone(),
            });
        }
        if let Err(e) = task.begin() {
            return TaskResult::err(TaskError::new(ErrorCode::Validation, e.to_string()));
        }
        self.event_bus.publish(RuntimeEvent::TaskStarted {
            task_id: task_id.clone(),
        });
        self.save_task(&task).await;

        let shared = Arc::new(Mutex::new(task));
        let history_slot: Arc<Mutex<Vec<AgentMessage>>> = Arc::new(Mutex::new(Vec::new()));
        self.checkpoints.register_provider(
            task_id.clone(),
            Arc::new(TaskStateProvider {
                task: Arc::clone(&shared),
                history: Arc::clone(&history_slot),
            }),
        );
        self.checkpoints.start_interval(&task_id);

        let cancel = CancelToken::new();
        self.cancel_tokens.insert(task_id.clone(), cancel.clone());

        let result = self.run_pipeline(&shared, &history_slot, &cancel).await;

        // Error checkpoint before the provider is torn down, then the
        // finally-equivalent: cancel every schedule for this task.
        if !result.success {
            let code = result
                .error_code()
                .map(|c| c.as_str())
                .unwrap_or("UNKNOWN");
            self.checkpoints
                .on_event(&task_id, CheckpointReason::Error, code)
                .await;
        }
        self.checkpoints.cancel_for_task(&task_id);
        self.cancel_tokens.remove(&task_id);

        let mut task = shared.lock().await;
        if let Err(e) = task.finish(result.clone()) {
            warn!(task_id = %task_id, error = %e, "could not finalise task status");
        }
        self.save_task(&task).await;

        if result.success {
            self.event_bus.publish(RuntimeEvent::TaskCompleted {
                task_id: task_id.clone(),
            });
        } else {
            self.event_bus.publish(RuntimeEvent::TaskFailed {
                task_id: task_id.clone(),
                code: result
                    .error_code()
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default(),
            });
        }
        result
    }

    /// Like [`execute`](Self::execute), but fatal failures enrol the task in
    /// the dead-letter queue.
    pub async fn execute_or_dead_letter(&self, task: Task) -> TaskResult {
        let task_id = task.id.clone();
        let result = self.execute(task).await;
        if !result.success {
            let fatal = result
                .errors
                .as_ref()
                .and_then(|e| e.first())
                .map(|e| !e.recoverable)
                .unwrap_or(true);
            if fatal {
                if let Ok(Some(task)) = self.store.load_task(&task_id).await {
                    let error = result
                        .errors
                        .as_ref()
                        .and_then(|e| e.first())
                        .cloned()
                        .unwrap_or_else(|| {
                            TaskError::new(ErrorCode::AgentError, "task failed")
                        });
                    if let Err(e) = self.dlq.add(task, error).await {
                        warn!(task_id = %task_id, error = %e, "dead-letter enrolment failed");
                    }
                }
            }
        }
        result
    }

    /// Take an entry out of the dead-letter queue and return its task, reset
    /// to pending with the retry count bumped.
    pub async fn retry_from_dead_letter_queue(&self, entry_id: &str) -> Result<Task, DlqError> {
        self.dlq.retry(entry_id).await
    }

    /// Signal cancellation to a running task's worker pool.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.cancel_tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                self.event_bus.publish(RuntimeEvent::TaskCancelled {
                    task_id: task_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    async fn run_pipeline(
        &self,
        shared: &Arc<Mutex<Task>>,
        history_slot: &Arc<Mutex<Vec<AgentMessage>>>,
        cancel: &CancelToken,
    ) -> TaskResult {
        let (task_id, prompt, context, depth) = {
            let task = shared.lock().await;
            (
                task.id.clone(),
                task.prompt.clone(),
                task.context.clone().unwrap_or_default(),
                task.metadata.decomposition_depth,
            )
        };

        let decision = match self.decide(&task_id, &prompt, &context).await {
            Ok(decision) => decision,
            Err(result) => return result,
        };

        let action = match &decision {
            Decision::Delegate { .. } => "delegate",
            Decision::Decompose { .. } => "decompose",
            Decision::ExecuteDirectly { .. } => "execute_directly",
            Decision::AskUser { .. } => "ask_user",
            Decision::Complete { .. } => "complete",
        };
        info!(task_id = %task_id, action, "orchestration decision");
        self.event_bus.publish(RuntimeEvent::DecisionMade {
            task_id: task_id.clone(),
            action: action.to_string(),
        });

        match decision {
            Decision::ExecuteDirectly { response } | Decision::Complete { response } => {
                TaskResult::ok(response)
            }
            Decision::AskUser { question } => TaskResult::ok(question.clone())
                .with_data(json!({ "action": "ask_user", "question": question })),
            Decision::Delegate { target_agent, task } => {
                // Validated already; the parse cannot regress here.
                let kind = AgentKind::from_name(&target_agent)
                    .expect("delegate target validated before dispatch");
                self.delegate(&task_id, &context, kind, &task, history_slot)
                    .await
            }
            Decision::Decompose {
                sub_tasks,
                reasoning,
            } => {
                self.decompose(
                    &task_id,
                    &context,
                    depth,
                    sub_tasks,
                    &reasoning,
                    history_slot,
                    cancel,
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Decision making
    // -----------------------------------------------------------------------

    async fn decide(
        &self,
        task_id: &str,
        prompt: &str,
        context: &TaskContext,
    ) -> Result<Decision, TaskResult> {
        // The routing cache is only valid for the agent set it was filled
        // under; a registration change invalidates it wholesale.
        let generation = self.agents.generation();
        if self.routing_generation.swap(generation, Ordering::Relaxed) != generation {
            self.routing.clear();
        }

        if let Some(decision) = self.routing.get(prompt) {
            info!(task_id, "routing cache hit");
            return Ok(decision);
        }

        let analysis = self.build_analysis_prompt(prompt, context);
        let reply = self
            .oracle
            .complete(
                ORCHESTRATOR_SYSTEM_PROMPT,
                &[AgentMessage::user(analysis)],
                &orchestration_tools(),
            )
            .await
            .map_err(|e| {
                TaskResult::err(TaskError::new(ErrorCode::AgentError, e.to_string()))
            })?;

        let decision = parse_decision(reply).map_err(|reason| {
            TaskResult::err(
                TaskError::new(ErrorCode::Validation, reason)
                    .with_suggestion("the decision was rejected; rephrase the task"),
            )
        })?;
        validate_decision(&decision).map_err(|reason| {
            TaskResult::err(TaskError::new(ErrorCode::Validation, reason))
        })?;

        self.routing.put(prompt, decision.clone());
        Ok(decision)
    }

    fn build_analysis_prompt(&self, prompt: &str, context: &TaskContext) -> String {
        let mut analysis = format!("## Task\n{prompt}\n");
        if let Some(dir) = &context.working_dir {
            analysis.push_str(&format!("\nWorking directory: {dir}\n"));
        }
        if !context.files.is_empty() {
            analysis.push_str("\nReferenced files:\n");
            for file in &context.files {
                analysis.push_str(&format!("- {file}\n"));
            }
        }
        analysis.push_str("\n## Available agents\n");
        for info in self.agents.agents_info() {
            analysis.push_str(&format!(
                "- {} ({:?}): {}\n",
                info.name, info.state, info.description
            ));
        }
        if self.web_search_available {
            analysis.push_str("\nWeb search is available to agents.\n");
        }
        analysis
    }

    // -----------------------------------------------------------------------
    // Dispatch: delegate
    // -----------------------------------------------------------------------

    async fn delegate(
        &self,
        task_id: &str,
        context: &TaskContext,
        kind: AgentKind,
        description: &str,
        history_slot: &Arc<Mutex<Vec<AgentMessage>>>,
    ) -> TaskResult {
        let Some(agent) = self.agents.get(kind) else {
            return TaskResult::err(TaskError::new(
                ErrorCode::AgentNotFound,
                format!("no `{kind}` agent is registered"),
            ));
        };

        let breaker = self.breakers.breaker(kind);
        if !breaker.is_allowed() {
            let retry_ms = breaker
                .retry_after()
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            return TaskResult::err(
                TaskError::new(
                    ErrorCode::CircuitOpen,
                    format!("circuit for `{kind}` is open"),
                )
                .with_suggestion(format!("retry in about {retry_ms}ms"))
                .with_context(json!({ "retryAfterMs": retry_ms })),
            );
        }

        self.checkpoints
            .on_event(task_id, CheckpointReason::Auto, "before_delegation")
            .await;
        self.event_bus.publish(RuntimeEvent::DelegationStarted {
            task_id: task_id.to_string(),
            agent: kind,
        });

        let mut sub_task = Task::new(kind.into(), description);
        sub_task.id = format!("{task_id}-delegate-{}", kind.name());
        sub_task.metadata.parent_task_id = Some(task_id.to_string());
        sub_task.metadata.source = Some("orchestrator".into());
        sub_task.context = Some(context.derive_for_subtask());
        let _ = sub_task.begin();
        self.save_task(&sub_task).await;

        let result = agent.execute(&sub_task).await;
        *history_slot.lock().await = agent.last_history().await;

        // The breaker records real outcomes only; a busy race is neither a
        // success nor a health failure.
        if result.error_code() == Some(ErrorCode::AgentBusy) {
            breaker.release_probe();
        } else if result.success {
            breaker.record_success();
        } else {
            breaker.record_failure();
            if breaker.state() == CircuitState::Open {
                self.event_bus
                    .publish(RuntimeEvent::CircuitOpened { agent: kind });
            }
        }

        let _ = sub_task.finish(result.clone());
        self.save_task(&sub_task).await;

        self.checkpoints
            .on_tokens(task_id, estimated_tokens(&result))
            .await;
        self.checkpoints
            .on_event(task_id, CheckpointReason::Auto, "after_delegation")
            .await;
        self.event_bus.publish(RuntimeEvent::DelegationFinished {
            task_id: task_id.to_string(),
            agent: kind,
            success: result.success,
        });

        if result.success {
            let mut out =
                TaskResult::ok(format!("[{kind}] {}", result.output)).with_data(json!({
                    "delegatedTo": kind.name(),
                    "subTaskId": sub_task.id,
                }));
            if let Some(artifacts) = result.artifacts {
                out = out.with_artifacts(artifacts);
            }
            out
        } else {
            TaskResult {
                success: false,
                output: result.output,
                errors: result.errors,
                artifacts: result.artifacts,
                data: Some(json!({ "delegatedTo": kind.name() })),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch: decompose
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn decompose(
        &self,
        task_id: &str,
        context: &TaskContext,
        depth: u32,
        drafts: Vec<SubTaskDraft>,
        reasoning: &str,
        history_slot: &Arc<Mutex<Vec<AgentMessage>>>,
        cancel: &CancelToken,
    ) -> TaskResult {
        if depth >= self.config.orchestrator.max_decomposition_depth {
            return TaskResult::err(
                TaskError::new(
                    ErrorCode::MaxDepthExceeded,
                    format!(
                        "decomposition depth {depth} has reached the limit of {}",
                        self.config.orchestrator.max_decomposition_depth
                    ),
                )
                .with_suggestion("delegate or answer directly at this depth"),
            );
        }
        if drafts.is_empty() {
            return TaskResult::err(TaskError::new(
                ErrorCode::NoSubtasks,
                "decomposition produced no sub-tasks",
            ));
        }

        let specs: Vec<SubTaskSpec> = drafts
            .iter()
            .enumerate()
            .map(|(index, draft)| SubTaskSpec {
                id: format!("{task_id}-sub-{index}"),
                agent: AgentKind::from_name(&draft.agent)
                    .expect("sub-task agents validated before dispatch"),
                task: draft.description.clone(),
                dependencies: draft
                    .depends_on
                    .iter()
                    .map(|&dep| format!("{task_id}-sub-{dep}"))
                    .collect(),
                priority: None,
            })
            .collect();

        let runner = Arc::new(DelegatingRunner {
            agents: Arc::clone(&self.agents),
            breakers: Arc::clone(&self.breakers),
            store: Arc::clone(&self.store),
            checkpoints: Arc::clone(&self.checkpoints),
            event_bus: self.event_bus.clone(),
            parent_task_id: task_id.to_string(),
            child_depth: depth + 1,
            tokens_used: AtomicU64::new(0),
            history_slot: Arc::clone(history_slot),
        });

        // Sub-task completions feed the progress trigger of the checkpoint
        // scheduler.
        let checkpoints = Arc::clone(&self.checkpoints);
        let progress_task_id = task_id.to_string();
        let hooks = crate::parallel::ProgressHooks {
            on_progress: Some(Box::new(move |completed, total, _outcome| {
                let checkpoints = Arc::clone(&checkpoints);
                let task_id = progress_task_id.clone();
                let progress = completed as f64 / total.max(1) as f64;
                tokio::spawn(async move {
                    checkpoints.on_progress(&task_id, progress).await;
                });
            })),
            ..Default::default()
        };

        let executor = ParallelExecutor::new(
            ParallelConfig {
                max_concurrency: self.config.orchestrator.max_concurrency,
                task_timeout: std::time::Duration::from_millis(
                    self.config.orchestrator.task_timeout_ms,
                ),
                continue_on_error: self.config.orchestrator.continue_on_error,
            },
            self.event_bus.clone(),
        )
        .with_hooks(hooks);

        let report = match executor
            .execute(task_id, context, specs, runner, cancel.clone())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                return TaskResult::err(TaskError::new(ErrorCode::Validation, e.to_string()))
            }
        };

        let summary = build_summary(&report);
        let stats = serde_json::to_value(&report.stats).unwrap_or_default();
        let artifacts = report.artifacts();
        let success = report.stats.failed == 0
            && report.stats.skipped == 0
            && report.stats.cancelled == 0;

        if success {
            let mut result = TaskResult::ok(summary).with_data(json!({
                "executionStats": stats,
                "reasoning": reasoning,
            }));
            if !artifacts.is_empty() {
                result = result.with_artifacts(artifacts);
            }
            result
        } else {
            let errors: Vec<TaskError> = report
                .outcomes
                .iter()
                .filter(|o| o.status == SubTaskStatus::Failed)
                .filter_map(|o| {
                    o.result
                        .as_ref()
                        .and_then(|r| r.errors.as_ref())
                        .and_then(|e| e.first())
                        .cloned()
                })
                .collect();
            TaskResult {
                success: false,
                output: summary,
                errors: Some(if errors.is_empty() {
                    vec![TaskError::new(
                        ErrorCode::Cancelled,
                        "decomposition did not run to completion",
                    )]
                } else {
                    errors
                }),
                artifacts: (!artifacts.is_empty()).then_some(artifacts),
                data: Some(json!({
                    "executionStats": stats,
                    "reasoning": reasoning,
                })),
            }
        }
    }

    async fn save_task(&self, task: &Task) {
        if let Err(e) = self.store.save_task(task).await {
            warn!(task_id = %task.id, error = %e, "task save failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-task runner used during decomposition
// ---------------------------------------------------------------------------

struct DelegatingRunner {
    agents: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn TaskStore>,
    checkpoints: Arc<CheckpointScheduler>,
    event_bus: EventBus,
    parent_task_id: String,
    child_depth: u32,
    /// Cumulative estimated token usage across sub-tasks; feeds the token
    /// trigger of the checkpoint scheduler.
    tokens_used: AtomicU64,
    /// Latest sub-task conversation, surfaced in parent checkpoints.
    history_slot: Arc<Mutex<Vec<AgentMessage>>>,
}

/// Estimated token usage an agent attached to its result, if any.
fn estimated_tokens(result: &TaskResult) -> u64 {
    result
        .data
        .as_ref()
        .and_then(|d| d.get("estimatedTokens"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl SubTaskRunner for DelegatingRunner {
    async fn run(&self, spec: SubTaskSpec, context: TaskContext) -> TaskResult {
        let breaker = self.breakers.breaker(spec.agent);
        if !breaker.is_allowed() {
            return TaskResult::err(
                TaskError::new(
                    ErrorCode::CircuitOpen,
                    format!("circuit for `{}` is open", spec.agent),
                )
                .with_suggestion("retry this sub-task after the cool-down"),
            );
        }

        let Some(agent) = self.agents.get(spec.agent) else {
            return TaskResult::err(TaskError::new(
                ErrorCode::AgentNotFound,
                format!("no `{}` agent is registered", spec.agent),
            ));
        };

        let mut child = Task::new(spec.agent.into(), &spec.task);
        child.id = spec.id.clone();
        child.metadata.parent_task_id = Some(self.parent_task_id.clone());
        child.metadata.decomposition_depth = self.child_depth;
        child.metadata.source = Some("orchestrator".into());
        child.context = Some(context);
        let _ = child.begin();
        if let Err(e) = self.store.save_task(&child).await {
            warn!(task_id = %child.id, error = %e, "sub-task save failed");
        }

        self.event_bus.publish(RuntimeEvent::DelegationStarted {
            task_id: self.parent_task_id.clone(),
            agent: spec.agent,
        });

        let result = agent.execute(&child).await;
        *self.history_slot.lock().await = agent.last_history().await;

        if result.error_code() == Some(ErrorCode::AgentBusy) {
            breaker.release_probe();
        } else if result.success {
            breaker.record_success();
        } else {
            breaker.record_failure();
            if breaker.state() == CircuitState::Open {
                self.event_bus
                    .publish(RuntimeEvent::CircuitOpened { agent: spec.agent });
            }
        }

        let _ = child.finish(result.clone());
        if let Err(e) = self.store.save_task(&child).await {
            warn!(task_id = %child.id, error = %e, "sub-task save failed");
        }

        let cumulative = self
            .tokens_used
            .fetch_add(estimated_tokens(&result), Ordering::Relaxed)
            + estimated_tokens(&result);
        self.checkpoints
            .on_tokens(&self.parent_task_id, cumulative)
            .await;

        self.checkpoints
            .on_event(
                &self.parent_task_id,
                CheckpointReason::Auto,
                &format!("sub_task_complete:{}", spec.id),
            )
            .await;
        self.event_bus.publish(RuntimeEvent::DelegationFinished {
            task_id: self.parent_task_id.clone(),
            agent: spec.agent,
            success: result.success,
        });

        result
    }
}

// ---------------------------------------------------------------------------
// Decision parsing and validation
// ---------------------------------------------------------------------------

fn parse_decision(reply: OracleReply) -> Result<Decision, String> {
    if let Some(call) = reply.tool_calls.first() {
        let input = &call.input;
        return match call.name.as_str() {
            "delegate_to_agent" => {
                let agent = input
                    .get("agent")
                    .and_then(|v| v.as_str())
                    .ok_or("delegate_to_agent is missing `agent`")?;
                let task = input
                    .get("task")
                    .and_then(|v| v.as_str())
                    .ok_or("delegate_to_agent is missing `task`")?;
                Ok(Decision::Delegate {
                    target_agent: agent.to_string(),
                    task: task.to_string(),
                })
            }
            "create_subtasks" => {
                let sub_tasks: Vec<SubTaskDraft> = serde_json::from_value(
                    input.get("sub_tasks").cloned().unwrap_or_default(),
                )
                .map_err(|e| format!("create_subtasks has malformed sub_tasks: {e}"))?;
                let reasoning = input
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(Decision::Decompose {
                    sub_tasks,
                    reasoning,
                })
            }
            "ask_user" => {
                let question = input
                    .get("question")
                    .and_then(|v| v.as_str())
                    .ok_or("ask_user is missing `question`")?;
                Ok(Decision::AskUser {
                    question: question.to_string(),
                })
            }
            "complete_task" => {
                let result = input
                    .get("result")
                    .and_then(|v| v.as_str())
                    .ok_or("complete_task is missing `result`")?;
                Ok(Decision::Complete {
                    response: result.to_string(),
                })
            }
            other => Err(format!("unrecognised orchestration tool `{other}`")),
        };
    }

    match reply.text {
        Some(text) if !text.trim().is_empty() => Ok(Decision::ExecuteDirectly { response: text }),
        _ => Err("oracle produced neither a decision tool call nor text".into()),
    }
}

fn validate_decision(decision: &Decision) -> Result<(), String> {
    match decision {
        Decision::Delegate { target_agent, task } => {
            if AgentKind::from_name(target_agent).is_none() {
                return Err(format!("unknown agent `{target_agent}`"));
            }
            if task.trim().is_empty() {
                return Err("delegated task description is empty".into());
            }
            Ok(())
        }
        Decision::Decompose { sub_tasks, .. } => {
            if sub_tasks.is_empty() {
                return Err("decomposition has no sub-tasks".into());
            }
            if sub_tasks.len() > MAX_SUBTASKS {
                return Err(format!(
                    "decomposition has {} sub-tasks; the limit is {MAX_SUBTASKS}",
                    sub_tasks.len()
                ));
            }
            for (index, sub_task) in sub_tasks.iter().enumerate() {
                if sub_task.description.trim().is_empty() {
                    return Err(format!("sub-task {index} has an empty description"));
                }
                if AgentKind::from_name(&sub_task.agent).is_none() {
                    return Err(format!(
                        "sub-task {index} names unknown agent `{}`",
                        sub_task.agent
                    ));
                }
                for &dep in &sub_task.depends_on {
                    if dep >= index {
                        return Err(format!(
                            "sub-task {index} depends on {dep}, which is not an earlier sub-task"
                        ));
                    }
                }
            }
            Ok(())
        }
        Decision::ExecuteDirectly { response } | Decision::Complete { response } => {
            if response.trim().is_empty() {
                return Err("completion result is empty".into());
            }
            Ok(())
        }
        Decision::AskUser { question } => {
            if question.trim().is_empty() {
                return Err("user question is empty".into());
            }
            Ok(())
        }
    }
}

/// Human-readable summary, grouped by execution level.
fn build_summary(report: &ExecutionReport) -> String {
    let stats = &report.stats;
    let mut summary = format!(
        "{}/{} sub-tasks succeeded across {} level(s)",
        stats.successful, stats.total, stats.levels
    );
    for level in 0..stats.levels {
        let members: Vec<&crate::parallel::SubTaskOutcome> = report
            .outcomes
            .iter()
            .filter(|o| o.level == level)
            .collect();
        if members.is_empty() {
            continue;
        }
        summary.push_str(&format!("\n\nLevel {level}:"));
        for outcome in members {
            let status = match outcome.status {
                SubTaskStatus::Succeeded => "ok",
                SubTaskStatus::Failed => "failed",
                SubTaskStatus::Skipped => "skipped",
                SubTaskStatus::Cancelled => "cancelled",
            };
            summary.push_str(&format!(
                "\n- [{}] {}: {}",
                outcome.spec.agent, outcome.spec.task, status
            ));
        }
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::ToolCall;

    fn call(name: &str, input: serde_json::Value) -> OracleReply {
        OracleReply::tool_calls(vec![ToolCall {
            id: "c1".into(),
            name: name.into(),
            input,
        }])
    }

    #[test]
    fn parse_delegate() {
        let reply = call(
            "delegate_to_agent",
            json!({"agent": "explore", "task": "find files"}),
        );
        let decision = parse_decision(reply).unwrap();
        assert_eq!(
            decision,
            Decision::Delegate {
                target_agent: "explore".into(),
                task: "find files".into()
            }
        );
    }

    #[test]
    fn parse_create_subtasks() {
        let reply = call(
            "create_subtasks",
            json!({
                "sub_tasks": [
                    {"agent": "explore", "description": "analyze"},
                    {"agent": "coder", "description": "implement", "depends_on": [0]},
                ],
                "reasoning": "two stages"
            }),
        );
        match parse_decision(reply).unwrap() {
            Decision::Decompose {
                sub_tasks,
                reasoning,
            } => {
                assert_eq!(sub_tasks.len(), 2);
                assert_eq!(sub_tasks[1].depends_on, vec![0]);
                assert_eq!(reasoning, "two stages");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn parse_plain_text_is_direct_answer() {
        let decision = parse_decision(OracleReply::text("The project uses Rust.")).unwrap();
        assert_eq!(
            decision,
            Decision::ExecuteDirectly {
                response: "The project uses Rust.".into()
            }
        );
    }

    #[test]
    fn parse_rejects_empty_and_unknown() {
        assert!(parse_decision(OracleReply::default()).is_err());
        assert!(parse_decision(call("launch_missiles", json!({}))).is_err());
        assert!(parse_decision(call("delegate_to_agent", json!({"agent": "explore"}))).is_err());
    }

    #[test]
    fn validate_delegate_rules() {
        assert!(validate_decision(&Decision::Delegate {
            target_agent: "explore".into(),
            task: "x".into()
        })
        .is_ok());
        assert!(validate_decision(&Decision::Delegate {
            target_agent: "wizard".into(),
            task: "x".into()
        })
        .is_err());
        assert!(validate_decision(&Decision::Delegate {
            target_agent: "explore".into(),
            task: "  ".into()
        })
        .is_err());
    }

    #[test]
    fn validate_decompose_rules() {
        let draft = |agent: &str, deps: Vec<usize>| SubTaskDraft {
            agent: agent.into(),
            description: "work".into(),
            depends_on: deps,
        };

        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: vec![draft("explore", vec![]), draft("coder", vec![0])],
            reasoning: String::new()
        })
        .is_ok());

        // Empty set.
        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: vec![],
            reasoning: String::new()
        })
        .is_err());

        // Too many.
        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: (0..21).map(|_| draft("explore", vec![])).collect(),
            reasoning: String::new()
        })
        .is_err());

        // Self reference.
        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: vec![draft("explore", vec![0])],
            reasoning: String::new()
        })
        .is_err());

        // Forward reference.
        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: vec![draft("explore", vec![1]), draft("coder", vec![])],
            reasoning: String::new()
        })
        .is_err());

        // Unknown agent.
        assert!(validate_decision(&Decision::Decompose {
            sub_tasks: vec![draft("wizard", vec![])],
            reasoning: String::new()
        })
        .is_err());
    }

    #[test]
    fn orchestration_tools_cover_all_decisions() {
        let tools = orchestration_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "delegate_to_agent",
                "create_subtasks",
                "ask_user",
                "complete_task"
            ]
        );
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object");
        }
    }
}
