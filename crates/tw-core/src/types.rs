use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::AgentMessage;

/// Version tag carried by every persisted entity. Loaders accept documents at
/// this version or lower; higher versions are rejected without an explicit
/// migration step.
pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// The specialised agent kinds the orchestrator can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Explore,
    Coder,
    Builder,
    Tester,
    Deployer,
    Reviewer,
    Fixer,
    Architect,
}

impl AgentKind {
    /// Every recognised agent kind, in delegation-priority order.
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Explore,
        AgentKind::Coder,
        AgentKind::Builder,
        AgentKind::Tester,
        AgentKind::Deployer,
        AgentKind::Reviewer,
        AgentKind::Fixer,
        AgentKind::Architect,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Explore => "explore",
            AgentKind::Coder => "coder",
            AgentKind::Builder => "builder",
            AgentKind::Tester => "tester",
            AgentKind::Deployer => "deployer",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Fixer => "fixer",
            AgentKind::Architect => "architect",
        }
    }

    /// Parse an agent name as emitted by the decision oracle.
    pub fn from_name(name: &str) -> Option<AgentKind> {
        AgentKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == name.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// Advisory availability state advertised through the agent registry.
///
/// The orchestrator still has to handle the race where an agent becomes busy
/// between the availability check and the actual call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Executing,
    Busy,
}

// ---------------------------------------------------------------------------
// TaskKind / TaskStatus
// ---------------------------------------------------------------------------

/// What kind of worker a task is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Orchestrator,
    Explore,
    Coder,
    Builder,
    Tester,
    Deployer,
    Reviewer,
    Fixer,
    Architect,
}

impl TaskKind {
    pub fn as_agent(&self) -> Option<AgentKind> {
        match self {
            TaskKind::Orchestrator => None,
            TaskKind::Explore => Some(AgentKind::Explore),
            TaskKind::Coder => Some(AgentKind::Coder),
            TaskKind::Builder => Some(AgentKind::Builder),
            TaskKind::Tester => Some(AgentKind::Tester),
            TaskKind::Deployer => Some(AgentKind::Deployer),
            TaskKind::Reviewer => Some(AgentKind::Reviewer),
            TaskKind::Fixer => Some(AgentKind::Fixer),
            TaskKind::Architect => Some(AgentKind::Architect),
        }
    }
}

impl From<AgentKind> for TaskKind {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Explore => TaskKind::Explore,
            AgentKind::Coder => TaskKind::Coder,
            AgentKind::Builder => TaskKind::Builder,
            AgentKind::Tester => TaskKind::Tester,
            AgentKind::Deployer => TaskKind::Deployer,
            AgentKind::Reviewer => TaskKind::Reviewer,
            AgentKind::Fixer => TaskKind::Fixer,
            AgentKind::Architect => TaskKind::Architect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Status transitions form a DAG: pending → (queued) → in_progress →
    /// (completed | failed). Terminal states accept no further transitions.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// The failure kinds surfaced to callers. Codes serialise in the wire form
/// callers match on (`"CIRCUIT_OPEN"`, `"MAX_DEPTH_EXCEEDED"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    AgentError,
    AgentNotFound,
    AgentBusy,
    CircuitOpen,
    MaxDepthExceeded,
    NoSubtasks,
    ExceededMaxSteps,
    ToolTimeout,
    ToolHandlerError,
    StorageError,
    Cancelled,
    DryRunBlocked,
}

impl ErrorCode {
    /// Default recoverability per the error taxonomy. Recoverable means the
    /// caller may retry (possibly after a delay); fatal means the same attempt
    /// must not be repeated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AgentBusy
                | ErrorCode::CircuitOpen
                | ErrorCode::ToolTimeout
                | ErrorCode::StorageError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::AgentError => "AGENT_ERROR",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::AgentBusy => "AGENT_BUSY",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            ErrorCode::NoSubtasks => "NO_SUBTASKS",
            ErrorCode::ExceededMaxSteps => "EXCEEDED_MAX_STEPS",
            ErrorCode::ToolTimeout => "TOOL_TIMEOUT",
            ErrorCode::ToolHandlerError => "TOOL_HANDLER_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::DryRunBlocked => "DRY_RUN_BLOCKED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, user-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.is_recoverable(),
            suggestion: None,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

// ---------------------------------------------------------------------------
// TaskContext / TaskMetadata / TaskResult
// ---------------------------------------------------------------------------

/// Optional context handed to a task: referenced files, working directory,
/// labelled code snippets, and arbitrary extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub snippets: HashMap<String, String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TaskContext {
    /// Derive a fresh context for a sub-task: files, working dir and extras
    /// are inherited, snippets are not (they belong to the parent's prompt).
    pub fn derive_for_subtask(&self) -> TaskContext {
        TaskContext {
            files: self.files.clone(),
            working_dir: self.working_dir.clone(),
            snippets: HashMap::new(),
            extra: self.extra.clone(),
        }
    }
}

/// The maximum chain length of "create sub-tasks" decisions.
pub const MAX_DECOMPOSITION_DEPTH: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Never decreases on descendants; capped at [`MAX_DECOMPOSITION_DEPTH`].
    #[serde(default)]
    pub decomposition_depth: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<TaskError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TaskResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            errors: None,
            artifacts: None,
            data: None,
        }
    }

    pub fn err(error: TaskError) -> Self {
        Self {
            success: false,
            output: String::new(),
            errors: Some(vec![error]),
            artifacts: None,
            data: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// First error code, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.errors.as_ref().and_then(|e| e.first()).map(|e| e.code)
    }
}

// ---------------------------------------------------------------------------
// TaskLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskStateError {
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("task `{0}` is already terminal")]
    AlreadyTerminal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
    #[serde(default = "schema_version")]
    pub schema_version: u32,
}

impl Task {
    pub fn new(kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            context: None,
            metadata: TaskMetadata::default(),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), TaskStateError> {
        if self.status.is_terminal() {
            return Err(TaskStateError::AlreadyTerminal(self.id.clone()));
        }
        if !self.status.can_transition_to(&to) {
            return Err(TaskStateError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn enqueue(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Queued)?;
        self.push_log(LogLevel::Info, "task queued");
        Ok(())
    }

    /// Move to in_progress and stamp `started_at`.
    pub fn begin(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        self.push_log(LogLevel::Info, "task started");
        Ok(())
    }

    /// Terminate with a result. The terminal status is derived from
    /// `result.success`; timestamps freeze from here on.
    pub fn finish(&mut self, result: TaskResult) -> Result<(), TaskStateError> {
        let target = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.transition(target)?;
        self.completed_at = Some(Utc::now());
        let level = if result.success {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.push_log(level, format!("task finished: {:?}", target));
        self.result = Some(result);
        Ok(())
    }

    /// Reset a terminal task back to pending for a retry. Clears the result
    /// and the frozen timestamps and bumps `retry_count`.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
        self.metadata.retry_count += 1;
        self.push_log(
            LogLevel::Info,
            format!("reset for retry #{}", self.metadata.retry_count),
        );
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(TaskLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Sub-task definitions
// ---------------------------------------------------------------------------

/// A sub-task as emitted by the decision oracle inside a decompose decision.
/// `depends_on` holds indexes of *prior* sub-tasks in the same decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskDraft {
    pub agent: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// A fully-resolved sub-task definition handed to the parallel executor.
/// `dependencies` refer to ids of prior sub-tasks in the same decomposition;
/// forward or self references are rejected by the graph builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub id: String,
    pub agent: AgentKind,
    pub task: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Secondary kick-off sort key within a level; higher runs first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The tagged decision the orchestrator acts on. Produced by parsing the
/// decision oracle's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Delegate {
        target_agent: String,
        task: String,
    },
    Decompose {
        sub_tasks: Vec<SubTaskDraft>,
        reasoning: String,
    },
    ExecuteDirectly {
        response: String,
    },
    AskUser {
        question: String,
    },
    Complete {
        response: String,
    },
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Auto,
    Pause,
    Error,
    Timeout,
    UserRequest,
}

/// A snapshot sufficient to reconstruct a task's in-progress state after a
/// process restart. Holds a deep copy of the task and its message history;
/// the task has no back-pointer to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub message_history: Vec<AgentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    #[serde(default = "schema_version")]
    pub schema_version: u32,
}

impl Checkpoint {
    pub fn new(task: &Task, reason: CheckpointReason) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task: task.clone(),
            agent_name: None,
            message_history: Vec::new(),
            partial_results: None,
            current_step: None,
            total_steps: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            reason,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn with_history(mut self, history: Vec<AgentMessage>) -> Self {
        self.message_history = history;
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_partial_results(mut self, partial: serde_json::Value) -> Self {
        self.partial_results = Some(partial);
        self
    }
}

// ---------------------------------------------------------------------------
// DeadLetterEntry
// ---------------------------------------------------------------------------

/// A terminally-failed task awaiting human or auto-retry action. Removed on
/// explicit retry or once `expires_at` has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub task: Task,
    pub error: TaskError,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "schema_version")]
    pub schema_version: u32,
}

impl DeadLetterEntry {
    pub fn new(task: Task, error: TaskError, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        let attempts = task.metadata.retry_count.max(1);
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            error,
            attempts,
            first_failed_at: now,
            last_failed_at: now,
            expires_at: now + ttl,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
