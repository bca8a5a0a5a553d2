use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tw_core::{
    AgentKind, AgentMessage, AgentState, ErrorCode, MessageHistory, Task, TaskError, TaskResult,
    ToolCall, ToolResult,
};
use tw_harness::capabilities::{CodeAnalyzer, Shell, TestRunner, WritableFileSystem};
use tw_harness::{ToolCategory, ToolDefinition, ToolExecutor};

use crate::oracle::DecisionOracle;
use crate::roles::{CommandLog, FileSnapshotSet, ReviewMemo, RoleProfile, TestHistory};

const DEFAULT_HISTORY_LIMIT: usize = 40;

// ---------------------------------------------------------------------------
// AgentBuilder
// ---------------------------------------------------------------------------

pub struct AgentBuilder {
    profile: RoleProfile,
    oracle: Arc<dyn DecisionOracle>,
    executor: Arc<ToolExecutor>,
    history_limit: usize,
    fs: Option<Arc<dyn WritableFileSystem>>,
    test_runner: Option<Arc<dyn TestRunner>>,
    shell: Option<Arc<dyn Shell>>,
    analyzer: Option<Arc<dyn CodeAnalyzer>>,
}

impl AgentBuilder {
    pub fn new(
        kind: AgentKind,
        oracle: Arc<dyn DecisionOracle>,
        executor: Arc<ToolExecutor>,
    ) -> Self {
        Self {
            profile: RoleProfile::for_kind(kind),
            oracle,
            executor,
            history_limit: DEFAULT_HISTORY_LIMIT,
            fs: None,
            test_runner: None,
            shell: None,
            analyzer: None,
        }
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.profile.max_steps = max_steps;
        self
    }

    pub fn filesystem(mut self, fs: Arc<dyn WritableFileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn test_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.test_runner = Some(runner);
        self
    }

    pub fn shell(mut self, shell: Arc<dyn Shell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn CodeAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            profile: self.profile,
            oracle: self.oracle,
            executor: self.executor,
            history_limit: self.history_limit,
            state: Mutex::new(AgentState::Idle),
            fs: self.fs,
            test_runner: self.test_runner,
            shell: self.shell,
            analyzer: self.analyzer,
            review_memo: ReviewMemo::default(),
            test_history: TestHistory::default(),
            command_log: CommandLog::default(),
            last_history: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One tool-calling loop: build the prompt, ask the oracle, run the requested
/// tools, append to history, repeat -- capped at the role's `max_steps`.
pub struct Agent {
    profile: RoleProfile,
    oracle: Arc<dyn DecisionOracle>,
    executor: Arc<ToolExecutor>,
    history_limit: usize,
    state: Mutex<AgentState>,
    fs: Option<Arc<dyn WritableFileSystem>>,
    test_runner: Option<Arc<dyn TestRunner>>,
    shell: Option<Arc<dyn Shell>>,
    analyzer: Option<Arc<dyn CodeAnalyzer>>,
    review_memo: ReviewMemo,
    test_history: TestHistory,
    command_log: CommandLog,
    /// Message history of the most recent run, kept for checkpointing.
    last_history: tokio::sync::Mutex<Vec<AgentMessage>>,
}

impl Agent {
    pub fn builder(
        kind: AgentKind,
        oracle: Arc<dyn DecisionOracle>,
        executor: Arc<ToolExecutor>,
    ) -> AgentBuilder {
        AgentBuilder::new(kind, oracle, executor)
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    pub fn name(&self) -> &'static str {
        self.profile.kind.name()
    }

    pub fn description(&self) -> &'static str {
        self.profile.description
    }

    pub fn profile(&self) -> &RoleProfile {
        &self.profile
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Advisory availability; a racing caller may still find the agent busy
    /// at `execute` time.
    pub fn is_available(&self) -> bool {
        self.state() == AgentState::Idle
    }

    /// Atomically claim the agent for one run.
    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == AgentState::Idle {
            *state = AgentState::Executing;
            true
        } else {
            false
        }
    }

    fn finish_run(&self) {
        *self.state.lock().expect("state lock poisoned") = AgentState::Idle;
    }

    /// Copy of the most recent run's conversation, for checkpointing.
    pub async fn last_history(&self) -> Vec<AgentMessage> {
        self.last_history.lock().await.clone()
    }

    pub async fn test_records(&self) -> Vec<crate::roles::TestRecord> {
        self.test_history.records().await
    }

    pub async fn executed_commands(&self) -> Vec<String> {
        self.command_log.commands().await
    }

    /// Kill every process the shell still reports running (builder only has
    /// a shell wired in, so elsewhere this is a no-op).
    pub async fn stop_all_processes(&self) -> usize {
        match &self.shell {
            Some(shell) => self
                .command_log
                .stop_all_processes(shell.as_ref())
                .await
                .unwrap_or(0),
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run the agent loop for one task. Never panics outward; every failure
    /// is folded into the returned `TaskResult`.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        if !self.try_begin() {
            return TaskResult::err(
                TaskError::new(
                    ErrorCode::AgentBusy,
                    format!("agent `{}` is busy", self.name()),
                )
                .with_suggestion("retry once the current run finishes"),
            );
        }

        info!(agent = self.name(), task_id = %task.id, "agent run started");
        let snapshots = self.capture_snapshots(task).await;
        let mut result = self.run_loop(task).await;

        // Post-run role behaviour: verification and rollback.
        match self.profile.kind {
            AgentKind::Coder => {
                if !result.success {
                    self.restore_snapshots(&snapshots).await;
                }
            }
            AgentKind::Fixer => {
                if result.success {
                    if let Some(verification_failure) = self.verify_fix().await {
                        if self.profile.rollback_on_failure {
                            self.restore_snapshots(&snapshots).await;
                        }
                        result = TaskResult::err(
                            TaskError::new(ErrorCode::AgentError, verification_failure)
                                .with_suggestion("inspect the failing verification output"),
                        );
                    }
                } else if self.profile.rollback_on_failure {
                    self.restore_snapshots(&snapshots).await;
                }
            }
            _ => {}
        }

        info!(
            agent = self.name(),
            task_id = %task.id,
            success = result.success,
            "agent run finished"
        );
        self.finish_run();
        result
    }

    async fn run_loop(&self, task: &Task) -> TaskResult {
        let mut history = MessageHistory::new(self.history_limit);
        let result = self.run_loop_inner(task, &mut history).await;
        *self.last_history.lock().await = history.messages().to_vec();
        result
    }

    async fn run_loop_inner(&self, task: &Task, history: &mut MessageHistory) -> TaskResult {
        history.add(tw_core::AgentMessage::user(
            self.build_initial_message(task).await,
        ));

        let mut artifacts: Vec<String> = Vec::new();

        for step in 1..=self.profile.max_steps {
            let tools = self.advertised_tools();
            let reply = match self
                .oracle
                .complete(&self.profile.system_prompt, history.messages(), &tools)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(agent = self.name(), error = %e, "oracle call failed");
                    return TaskResult::err(TaskError::new(ErrorCode::AgentError, e.to_string()));
                }
            };

            if reply.has_tool_calls() {
                history.trim_if_needed();

                let calls = reply.tool_calls.clone();
                let parallel = calls.len() > 1;
                let results = self.executor.execute_all(&calls, parallel).await;

                self.collect_artifacts(&calls, &results, &mut artifacts);
                self.role_hooks(&calls, &results).await;

                history.add(tw_core::AgentMessage::assistant_with_calls(
                    reply.text.unwrap_or_default(),
                    calls,
                ));
                history.add_tool_results(results);
                continue;
            }

            match reply.text {
                Some(text) => {
                    let mut result = TaskResult::ok(text).with_data(serde_json::json!({
                        "estimatedTokens": history.estimated_tokens(),
                        "steps": step,
                    }));
                    if !artifacts.is_empty() {
                        result = result.with_artifacts(artifacts);
                    }
                    return result;
                }
                None => {
                    warn!(agent = self.name(), step, "oracle returned an empty reply");
                    return TaskResult::err(TaskError::new(
                        ErrorCode::AgentError,
                        "oracle returned neither text nor tool calls",
                    ));
                }
            }
        }

        TaskResult::err(
            TaskError::new(
                ErrorCode::ExceededMaxSteps,
                format!(
                    "agent `{}` hit the {}-step cap without terminating",
                    self.name(),
                    self.profile.max_steps
                ),
            )
            .with_suggestion("decompose the task or raise the step budget"),
        )
    }

    fn advertised_tools(&self) -> Vec<ToolDefinition> {
        self.executor
            .registry()
            .get_definitions()
            .iter()
            .filter(|d| self.profile.allows(d.category))
            .cloned()
            .collect()
    }

    async fn build_initial_message(&self, task: &Task) -> String {
        let mut content = task.prompt.clone();
        if let Some(context) = &task.context {
            if let Some(dir) = &context.working_dir {
                content.push_str(&format!("\n\nWorking directory: {dir}"));
            }
            if !context.files.is_empty() {
                content.push_str("\n\nRelevant files:");
                for file in &context.files {
                    content.push_str(&format!("\n- {file}"));
                }
            }
            for (label, snippet) in &context.snippets {
                content.push_str(&format!("\n\n{label}:\n```\n{snippet}\n```"));
            }
        }

        // The reviewer front-loads memoised analysis of the referenced files.
        if self.profile.kind == AgentKind::Reviewer {
            if let Some(report) = self.prior_analysis(task).await {
                content.push_str(&report);
            }
        }
        content
    }

    async fn prior_analysis(&self, task: &Task) -> Option<String> {
        let analyzer = self.analyzer.as_ref()?;
        let fs = self.fs.as_ref()?;
        let files = &task.context.as_ref()?.files;
        if files.is_empty() {
            return None;
        }

        let mut report = String::from("\n\nAutomated analysis:");
        for path in files {
            let Ok(content) = fs.read_file(path).await else {
                continue;
            };
            let analysis = match self.review_memo.get(path, &content).await {
                Some(cached) => cached,
                None => match analyzer.analyze(path, &content).await {
                    Ok(fresh) => {
                        self.review_memo.put(path, &content, fresh.clone()).await;
                        fresh
                    }
                    Err(_) => continue,
                },
            };
            report.push_str(&format!(
                "\n- {path}: score {}/100, {} issue(s)",
                analysis.score,
                analysis.issues.len()
            ));
        }
        Some(report)
    }

    fn collect_artifacts(
        &self,
        calls: &[ToolCall],
        results: &[ToolResult],
        artifacts: &mut Vec<String>,
    ) {
        for (call, result) in calls.iter().zip(results) {
            if result.is_error {
                continue;
            }
            let category = self
                .executor
                .registry()
                .definition(&call.name)
                .map(|d| d.category);
            if category == Some(ToolCategory::FileWrite) {
                if let Some(path) = call.input.get("path").and_then(|p| p.as_str()) {
                    if !artifacts.iter().any(|a| a == path) {
                        artifacts.push(path.to_string());
                    }
                }
            }
        }
    }

    /// Per-kind bookkeeping after a tool round: the tester records test
    /// outcomes, the builder records shell commands.
    async fn role_hooks(&self, calls: &[ToolCall], results: &[ToolResult]) {
        match self.profile.kind {
            AgentKind::Tester => {
                for (call, result) in calls.iter().zip(results) {
                    let category = self
                        .executor
                        .registry()
                        .definition(&call.name)
                        .map(|d| d.category);
                    if category == Some(ToolCategory::Test) {
                        let summary = result
                            .output
                            .get("output")
                            .and_then(|o| o.as_str())
                            .unwrap_or("test run")
                            .to_string();
                        self.test_history.record(!result.is_error, summary).await;
                    }
                }
            }
            AgentKind::Builder => {
                for call in calls {
                    let category = self
                        .executor
                        .registry()
                        .definition(&call.name)
                        .map(|d| d.category);
                    if category == Some(ToolCategory::ShellCommand) {
                        if let Some(cmd) = call
                            .input
                            .get("command")
                            .or_else(|| call.input.get("cmd"))
                            .and_then(|c| c.as_str())
                        {
                            self.command_log.record(cmd).await;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn capture_snapshots(&self, task: &Task) -> Option<FileSnapshotSet> {
        if self.profile.read_only {
            return None;
        }
        let fs = self.fs.as_ref()?;
        let files = task
            .context
            .as_ref()
            .map(|c| c.files.clone())
            .unwrap_or_default();
        if files.is_empty() {
            return None;
        }
        match FileSnapshotSet::capture(fs.as_ref(), &files).await {
            Ok(snapshots) => Some(snapshots),
            Err(e) => {
                warn!(agent = self.name(), error = %e, "snapshot capture failed");
                None
            }
        }
    }

    async fn restore_snapshots(&self, snapshots: &Option<FileSnapshotSet>) {
        let (Some(snapshots), Some(fs)) = (snapshots, self.fs.as_ref()) else {
            return;
        };
        if let Err(e) = snapshots.restore(fs.as_ref()).await {
            warn!(agent = self.name(), error = %e, "snapshot restore failed");
        }
    }

    /// Post-fix verification for the fixer: run the configured test suite and
    /// report the failure output, if any.
    async fn verify_fix(&self) -> Option<String> {
        let runner = self.test_runner.as_ref()?;
        match runner.run(None).await {
            Ok(outcome) if outcome.success => None,
            Ok(outcome) => Some(format!("post-fix verification failed: {}", outcome.output)),
            Err(e) => Some(format!("post-fix verification errored: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, OracleReply};
    use serde_json::json;
    use std::collections::VecDeque;
    use tw_core::config::DryRunConfig;
    use tw_core::{AgentMessage, ExecutionMode, TaskContext, TaskKind};
    use tw_harness::capabilities::{CapabilityError, MemoryFileSystem, TestRunOutcome};
    use tw_harness::FileSystem;
    use tw_harness::{
        DryRunManager, ExecutionModeGuard, ExecutorConfig, FnHandler, RegisterOptions,
        ToolRegistry,
    };

    // -- Scripted oracle --

    struct ScriptedOracle {
        replies: tokio::sync::Mutex<VecDeque<Result<OracleReply, OracleError>>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<OracleReply, OracleError>>) -> Self {
            Self {
                replies: tokio::sync::Mutex::new(replies.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DecisionOracle for ScriptedOracle {
        async fn complete(
            &self,
            _system_prompt: &str,
            _messages: &[AgentMessage],
            _tools: &[ToolDefinition],
        ) -> Result<OracleReply, OracleError> {
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(OracleReply::text("fallthrough")))
        }
    }

    fn tool_executor(fs: MemoryFileSystem) -> Arc<ToolExecutor> {
        let registry = Arc::new(ToolRegistry::new());

        let read_fs = fs.clone();
        registry
            .register(
                tw_harness::ToolDefinition::new(
                    "read_file",
                    "Read a file",
                    ToolCategory::FileRead,
                ),
                Arc::new(FnHandler::new(move |input| {
                    let fs = read_fs.clone();
                    async move {
                        let path = input["path"].as_str().unwrap_or_default().to_string();
                        match fs.read_file(&path).await {
                            Ok(content) => Ok(json!({ "content": content })),
                            Err(e) => Err(tw_harness::ToolError::Handler(e.to_string())),
                        }
                    }
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let write_fs = fs.clone();
        registry
            .register(
                tw_harness::ToolDefinition::new(
                    "write_file",
                    "Write a file",
                    ToolCategory::FileWrite,
                ),
                Arc::new(FnHandler::new(move |input| {
                    let fs = write_fs.clone();
                    async move {
                        let path = input["path"].as_str().unwrap_or_default().to_string();
                        let content = input["content"].as_str().unwrap_or_default().to_string();
                        fs.write_file(&path, &content)
                            .await
                            .map_err(|e| tw_harness::ToolError::Handler(e.to_string()))?;
                        Ok(json!({ "written": path }))
                    }
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        Arc::new(ToolExecutor::new(
            registry,
            Arc::new(ExecutionModeGuard::new(ExecutionMode::Execute)),
            Arc::new(DryRunManager::new(&DryRunConfig::default())),
            ExecutorConfig::default(),
        ))
    }

    fn write_call(id: &str, path: &str, content: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "write_file".into(),
            input: json!({"path": path, "content": content}),
        }
    }

    #[tokio::test]
    async fn text_reply_terminates_with_success() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            "Found 5 TypeScript files",
        ))]));
        let agent = Agent::builder(AgentKind::Explore, oracle, tool_executor(MemoryFileSystem::new()))
            .build();

        let task = Task::new(TaskKind::Explore, "find the TypeScript files");
        let result = agent.execute(&task).await;
        assert!(result.success);
        assert_eq!(result.output, "Found 5 TypeScript files");
        assert!(agent.is_available());
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let fs = MemoryFileSystem::with_files(&[("src/lib.rs", "pub fn x() {}")]).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Ok(OracleReply::tool_calls(vec![ToolCall {
                id: "c1".into(),
                name: "read_file".into(),
                input: json!({"path": "src/lib.rs"}),
            }])),
            Ok(OracleReply::text("lib.rs defines x()")),
        ]));
        let agent = Agent::builder(AgentKind::Explore, oracle, tool_executor(fs)).build();

        let result = agent
            .execute(&Task::new(TaskKind::Explore, "what is in lib.rs"))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "lib.rs defines x()");
    }

    #[tokio::test]
    async fn step_cap_yields_exceeded_max_steps() {
        let replies: Vec<Result<OracleReply, OracleError>> = (0..20)
            .map(|i| {
                Ok(OracleReply::tool_calls(vec![ToolCall {
                    id: format!("c{i}"),
                    name: "read_file".into(),
                    input: json!({"path": "missing.rs"}),
                }]))
            })
            .collect();
        let oracle = Arc::new(ScriptedOracle::new(replies));
        let agent = Agent::builder(
            AgentKind::Explore,
            oracle,
            tool_executor(MemoryFileSystem::new()),
        )
        .max_steps(3)
        .build();

        let result = agent.execute(&Task::new(TaskKind::Explore, "loop forever")).await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ErrorCode::ExceededMaxSteps));
    }

    #[tokio::test]
    async fn oracle_error_becomes_agent_error() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Err(OracleError::Unavailable(
            "connection reset".into(),
        ))]));
        let agent = Agent::builder(
            AgentKind::Explore,
            oracle,
            tool_executor(MemoryFileSystem::new()),
        )
        .build();

        let result = agent.execute(&Task::new(TaskKind::Explore, "anything")).await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ErrorCode::AgentError));
    }

    #[tokio::test]
    async fn successful_writes_become_artifacts() {
        let fs = MemoryFileSystem::new();
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Ok(OracleReply::tool_calls(vec![write_call(
                "c1",
                "src/feature.rs",
                "pub fn feature() {}",
            )])),
            Ok(OracleReply::text("implemented the feature")),
        ]));
        let agent = Agent::builder(AgentKind::Coder, oracle, tool_executor(fs.clone())).build();

        let result = agent
            .execute(&Task::new(TaskKind::Coder, "implement the feature"))
            .await;
        assert!(result.success);
        assert_eq!(
            result.artifacts.as_ref().unwrap(),
            &vec!["src/feature.rs".to_string()]
        );
        assert!(fs.exists("src/feature.rs").await.unwrap());
    }

    #[tokio::test]
    async fn coder_failure_restores_snapshots() {
        let fs = MemoryFileSystem::with_files(&[("src/main.rs", "fn main() {}")]).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Ok(OracleReply::tool_calls(vec![
                write_call("c1", "src/main.rs", "broken edit"),
                write_call("c2", "src/extra.rs", "new file"),
            ])),
            Err(OracleError::Unavailable("model died mid-run".into())),
        ]));

        let task = Task::new(TaskKind::Coder, "edit main").with_context(TaskContext {
            files: vec!["src/main.rs".into(), "src/extra.rs".into()],
            ..Default::default()
        });

        let agent = Agent::builder(AgentKind::Coder, oracle, tool_executor(fs.clone()))
            .filesystem(Arc::new(fs.clone()))
            .build();

        let result = agent.execute(&task).await;
        assert!(!result.success);
        // Pre-existing file restored, newly created file removed.
        assert_eq!(fs.read_file("src/main.rs").await.unwrap(), "fn main() {}");
        assert!(!fs.exists("src/extra.rs").await.unwrap());
    }

    #[tokio::test]
    async fn fixer_verification_failure_rolls_back() {
        struct FailingRunner;
        #[async_trait::async_trait]
        impl TestRunner for FailingRunner {
            async fn detect_framework(&self) -> Result<String, CapabilityError> {
                Ok("cargo".into())
            }
            async fn run(&self, _pattern: Option<&str>) -> Result<TestRunOutcome, CapabilityError> {
                Ok(TestRunOutcome {
                    success: false,
                    output: "2 tests failed".into(),
                })
            }
            async fn coverage(&self) -> Result<TestRunOutcome, CapabilityError> {
                Ok(TestRunOutcome {
                    success: true,
                    output: String::new(),
                })
            }
        }

        let fs = MemoryFileSystem::with_files(&[("src/bug.rs", "original")]).await;
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Ok(OracleReply::tool_calls(vec![write_call(
                "c1",
                "src/bug.rs",
                "attempted fix",
            )])),
            Ok(OracleReply::text("fixed it")),
        ]));

        let task = Task::new(TaskKind::Fixer, "fix the bug").with_context(TaskContext {
            files: vec!["src/bug.rs".into()],
            ..Default::default()
        });

        let agent = Agent::builder(AgentKind::Fixer, oracle, tool_executor(fs.clone()))
            .filesystem(Arc::new(fs.clone()))
            .test_runner(Arc::new(FailingRunner))
            .build();

        let result = agent.execute(&task).await;
        assert!(!result.success);
        assert!(result.errors.unwrap()[0].message.contains("verification"));
        assert_eq!(fs.read_file("src/bug.rs").await.unwrap(), "original");
    }

    #[tokio::test]
    async fn busy_agent_rejects_second_run() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text("ok"))]));
        let agent = Agent::builder(
            AgentKind::Explore,
            oracle,
            tool_executor(MemoryFileSystem::new()),
        )
        .build();

        assert!(agent.try_begin());
        let result = agent.execute(&Task::new(TaskKind::Explore, "x")).await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ErrorCode::AgentBusy));
        agent.finish_run();
    }

    #[tokio::test]
    async fn read_only_role_does_not_advertise_write_tools() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text("done"))]));
        let agent = Agent::builder(
            AgentKind::Explore,
            oracle,
            tool_executor(MemoryFileSystem::new()),
        )
        .build();

        let tools = agent.advertised_tools();
        assert!(tools.iter().any(|t| t.name == "read_file"));
        assert!(!tools.iter().any(|t| t.name == "write_file"));
    }
}
