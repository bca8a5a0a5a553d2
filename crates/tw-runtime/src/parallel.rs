//! Dependency-aware parallel execution of sub-task graphs.
//!
//! Sub-tasks are layered with Kahn's algorithm; each level runs through a
//! bounded worker pool and completes entirely before the next level starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use tw_core::{
    ErrorCode, EventBus, RuntimeEvent, SubTaskSpec, TaskContext, TaskError, TaskResult,
};

use crate::cancel::CancelToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate sub-task id `{0}`")]
    DuplicateId(String),
    #[error("sub-task `{0}` depends on itself")]
    SelfDependency(String),
    #[error("sub-task `{id}` references unknown dependency `{dependency}`")]
    UnknownDependency { id: String, dependency: String },
    #[error("sub-task `{id}` references later sub-task `{dependency}`")]
    ForwardDependency { id: String, dependency: String },
    #[error("dependency cycle involving `{0}`")]
    Cycle(String),
    #[error("no sub-tasks to execute")]
    Empty,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Succeeded,
    Failed,
    /// Never started: a dependency failed or was itself skipped.
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskOutcome {
    pub spec: SubTaskSpec,
    pub level: usize,
    pub status: SubTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub levels: usize,
    /// Average level width: `total / levels`. 1.0 means fully sequential.
    pub parallel_efficiency: f64,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<SubTaskOutcome>,
    pub stats: ExecutionStats,
}

impl ExecutionReport {
    /// Artefacts aggregated from successful sub-tasks, in outcome order.
    pub fn artifacts(&self) -> Vec<String> {
        let mut artifacts = Vec::new();
        for outcome in &self.outcomes {
            if outcome.status != SubTaskStatus::Succeeded {
                continue;
            }
            if let Some(result) = &outcome.result {
                if let Some(found) = &result.artifacts {
                    for artifact in found {
                        if !artifacts.contains(artifact) {
                            artifacts.push(artifact.clone());
                        }
                    }
                }
            }
        }
        artifacts
    }
}

// ---------------------------------------------------------------------------
// Runner and hooks
// ---------------------------------------------------------------------------

/// Executes one sub-task. The parallel executor supplies a fresh context
/// derived from the parent task's context.
#[async_trait::async_trait]
pub trait SubTaskRunner: Send + Sync {
    async fn run(&self, spec: SubTaskSpec, context: TaskContext) -> TaskResult;
}

type ProgressFn = dyn Fn(usize, usize, &SubTaskOutcome) + Send + Sync;
type LevelStartFn = dyn Fn(usize, usize) + Send + Sync;
type LevelCompleteFn = dyn Fn(usize, &[SubTaskOutcome]) + Send + Sync;

/// Optional per-call observation hooks, mirroring the bus events.
#[derive(Default)]
pub struct ProgressHooks {
    pub on_progress: Option<Box<ProgressFn>>,
    pub on_level_start: Option<Box<LevelStartFn>>,
    pub on_level_complete: Option<Box<LevelCompleteFn>>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    /// When false, a failure in level L aborts all later levels.
    pub continue_on_error: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            task_timeout: Duration::from_secs(120),
            continue_on_error: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Graph layering
// ---------------------------------------------------------------------------

/// Validate the graph and produce topological levels.
///
/// Level 0 holds the sub-tasks with no dependencies; each subsequent level
/// holds the sub-tasks whose dependencies are all in earlier levels. Forward
/// and self references fail fast, as do cycles and duplicate ids.
pub fn build_levels(specs: &[SubTaskSpec]) -> Result<Vec<Vec<usize>>, GraphError> {
    if specs.is_empty() {
        return Err(GraphError::Empty);
    }

    let mut position: HashMap<&str, usize> = HashMap::new();
    for (index, spec) in specs.iter().enumerate() {
        if position.insert(spec.id.as_str(), index).is_some() {
            return Err(GraphError::DuplicateId(spec.id.clone()));
        }
    }

    for (index, spec) in specs.iter().enumerate() {
        for dependency in &spec.dependencies {
            match position.get(dependency.as_str()) {
                None => {
                    return Err(GraphError::UnknownDependency {
                        id: spec.id.clone(),
                        dependency: dependency.clone(),
                    })
                }
                Some(&dep_index) if dep_index == index => {
                    return Err(GraphError::SelfDependency(spec.id.clone()))
                }
                Some(&dep_index) if dep_index > index => {
                    return Err(GraphError::ForwardDependency {
                        id: spec.id.clone(),
                        dependency: dependency.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }

    // Kahn's layering over the validated DAG.
    let mut remaining: HashMap<usize, HashSet<usize>> = specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let deps = spec
                .dependencies
                .iter()
                .map(|d| position[d.as_str()])
                .collect::<HashSet<usize>>();
            (index, deps)
        })
        .collect();

    let mut levels: Vec<Vec<usize>> = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<usize> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(index, _)| *index)
            .collect();
        if ready.is_empty() {
            let stuck = *remaining.keys().min().expect("remaining is non-empty");
            return Err(GraphError::Cycle(specs[stuck].id.clone()));
        }
        ready.sort_unstable();
        for index in &ready {
            remaining.remove(index);
        }
        for deps in remaining.values_mut() {
            for index in &ready {
                deps.remove(index);
            }
        }
        levels.push(ready);
    }
    Ok(levels)
}

// ---------------------------------------------------------------------------
// ParallelExecutor
// ---------------------------------------------------------------------------

pub struct ParallelExecutor {
    config: ParallelConfig,
    event_bus: EventBus,
    hooks: ProgressHooks,
}

impl ParallelExecutor {
    pub fn new(config: ParallelConfig, event_bus: EventBus) -> Self {
        Self {
            config,
            event_bus,
            hooks: ProgressHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ProgressHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Execute the sub-task graph level by level.
    ///
    /// Within a level, sub-tasks start in input order (priority as the
    /// secondary key, higher first) but complete in any order; a level
    /// completes entirely before the next begins.
    pub async fn execute(
        &self,
        parent_task_id: &str,
        parent_context: &TaskContext,
        specs: Vec<SubTaskSpec>,
        runner: Arc<dyn SubTaskRunner>,
        cancel: CancelToken,
    ) -> Result<ExecutionReport, GraphError> {
        let levels = build_levels(&specs)?;
        let started = std::time::Instant::now();
        let total = specs.len();

        info!(
            task_id = parent_task_id,
            sub_tasks = total,
            levels = levels.len(),
            "executing sub-task graph"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut outcomes_by_index: HashMap<usize, SubTaskOutcome> = HashMap::new();
        let mut terminal_failure: HashSet<String> = HashSet::new();
        let mut completed = 0usize;
        let mut abort_remaining = false;

        for (level_number, level) in levels.iter().enumerate() {
            if abort_remaining || cancel.is_cancelled() {
                for &index in level {
                    let status = if cancel.is_cancelled() {
                        SubTaskStatus::Cancelled
                    } else {
                        SubTaskStatus::Skipped
                    };
                    outcomes_by_index
                        .insert(index, skipped_outcome(&specs[index], level_number, status));
                }
                continue;
            }

            // Kick-off order: input order, with priority (higher first) as
            // the secondary sort key. The sort is stable, so equal
            // priorities keep input order.
            let mut order = level.clone();
            order.sort_by_key(|&index| {
                std::cmp::Reverse(specs[index].priority.unwrap_or_default())
            });

            self.emit_level_start(parent_task_id, level_number, level.len());

            let mut handles = Vec::new();
            for index in order {
                let spec = specs[index].clone();

                // A failed or skipped dependency keeps descendants from
                // starting; they are reported as skipped, not failed.
                if spec
                    .dependencies
                    .iter()
                    .any(|dep| terminal_failure.contains(dep))
                {
                    terminal_failure.insert(spec.id.clone());
                    let outcome = skipped_outcome(&spec, level_number, SubTaskStatus::Skipped);
                    completed += 1;
                    self.emit_progress(parent_task_id, completed, total, &outcome);
                    outcomes_by_index.insert(index, outcome);
                    continue;
                }

                if cancel.is_cancelled() {
                    outcomes_by_index.insert(
                        index,
                        skipped_outcome(&spec, level_number, SubTaskStatus::Cancelled),
                    );
                    continue;
                }

                let runner = Arc::clone(&runner);
                let cancel_for_task = cancel.clone();
                let context = parent_context.derive_for_subtask();
                let timeout = self.config.task_timeout;
                // Acquiring here (not inside the worker) makes the kick-off
                // order deterministic under the concurrency bound.
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                handles.push((
                    index,
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_sub_task(runner, spec, context, timeout, cancel_for_task).await
                    }),
                ));
            }

            let mut level_failed = false;
            for (index, handle) in handles {
                let spec = &specs[index];
                let (status, result) = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(sub_task = %spec.id, error = %e, "sub-task join error");
                        (
                            SubTaskStatus::Failed,
                            Some(TaskResult::err(TaskError::new(
                                ErrorCode::AgentError,
                                format!("sub-task worker panicked: {e}"),
                            ))),
                        )
                    }
                };

                if matches!(status, SubTaskStatus::Failed | SubTaskStatus::Cancelled) {
                    terminal_failure.insert(spec.id.clone());
                    level_failed = true;
                }

                let outcome = SubTaskOutcome {
                    spec: spec.clone(),
                    level: level_number,
                    status,
                    result,
                };
                completed += 1;
                self.emit_progress(parent_task_id, completed, total, &outcome);
                outcomes_by_index.insert(index, outcome);
            }

            let level_outcomes: Vec<SubTaskOutcome> = level
                .iter()
                .filter_map(|index| outcomes_by_index.get(index).cloned())
                .collect();
            self.emit_level_complete(parent_task_id, level_number, &level_outcomes);

            if level_failed && !self.config.continue_on_error {
                warn!(
                    task_id = parent_task_id,
                    level = level_number,
                    "aborting remaining levels after failure"
                );
                abort_remaining = true;
            }
        }

        let mut outcomes: Vec<SubTaskOutcome> = (0..specs.len())
            .map(|index| {
                outcomes_by_index
                    .remove(&index)
                    .expect("every sub-task has an outcome")
            })
            .collect();
        outcomes.sort_by_key(|o| o.level);

        let stats = compute_stats(&outcomes, levels.len(), started.elapsed());
        info!(
            task_id = parent_task_id,
            successful = stats.successful,
            failed = stats.failed,
            skipped = stats.skipped,
            "sub-task graph finished"
        );

        Ok(ExecutionReport { outcomes, stats })
    }

    fn emit_level_start(&self, task_id: &str, level: usize, count: usize) {
        if let Some(hook) = &self.hooks.on_level_start {
            hook(level, count);
        }
        self.event_bus.publish(RuntimeEvent::LevelStarted {
            task_id: task_id.to_string(),
            level,
            count,
        });
    }

    fn emit_level_complete(&self, task_id: &str, level: usize, outcomes: &[SubTaskOutcome]) {
        if let Some(hook) = &self.hooks.on_level_complete {
            hook(level, outcomes);
        }
        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == SubTaskStatus::Succeeded)
            .count();
        self.event_bus.publish(RuntimeEvent::LevelCompleted {
            task_id: task_id.to_string(),
            level,
            succeeded,
            failed: outcomes.len() - succeeded,
        });
    }

    fn emit_progress(
        &self,
        task_id: &str,
        completed: usize,
        total: usize,
        outcome: &SubTaskOutcome,
    ) {
        if let Some(hook) = &self.hooks.on_progress {
            hook(completed, total, outcome);
        }
        self.event_bus.publish(RuntimeEvent::SubTaskProgress {
            task_id: task_id.to_string(),
            completed,
            total,
        });
    }
}

fn skipped_outcome(spec: &SubTaskSpec, level: usize, status: SubTaskStatus) -> SubTaskOutcome {
    let error = match status {
        SubTaskStatus::Cancelled => TaskError::new(ErrorCode::Cancelled, "cancelled before start"),
        _ => TaskError::new(
            ErrorCode::AgentError,
            "skipped: an upstream dependency did not succeed",
        ),
    };
    SubTaskOutcome {
        spec: spec.clone(),
        level,
        status,
        result: Some(TaskResult::err(error)),
    }
}

async fn run_sub_task(
    runner: Arc<dyn SubTaskRunner>,
    spec: SubTaskSpec,
    context: TaskContext,
    timeout: Duration,
    cancel: CancelToken,
) -> (SubTaskStatus, Option<TaskResult>) {
    let id = spec.id.clone();
    tokio::select! {
        outcome = tokio::time::timeout(timeout, runner.run(spec, context)) => match outcome {
            Ok(result) if result.success => (SubTaskStatus::Succeeded, Some(result)),
            Ok(result) => (SubTaskStatus::Failed, Some(result)),
            Err(_) => {
                warn!(sub_task = %id, timeout_ms = timeout.as_millis() as u64, "sub-task timed out");
                (
                    SubTaskStatus::Failed,
                    Some(TaskResult::err(TaskError::new(
                        ErrorCode::ToolTimeout,
                        format!("sub-task `{id}` timed out after {}ms", timeout.as_millis()),
                    ))),
                )
            }
        },
        _ = cancel.cancelled() => (
            SubTaskStatus::Cancelled,
            Some(TaskResult::err(TaskError::new(
                ErrorCode::Cancelled,
                format!("sub-task `{id}` cancelled"),
            ))),
        ),
    }
}

fn compute_stats(
    outcomes: &[SubTaskOutcome],
    levels: usize,
    elapsed: Duration,
) -> ExecutionStats {
    let mut stats = ExecutionStats {
        total: outcomes.len(),
        levels,
        total_time_ms: elapsed.as_millis() as u64,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.status {
            SubTaskStatus::Succeeded => stats.successful += 1,
            SubTaskStatus::Failed => stats.failed += 1,
            SubTaskStatus::Skipped => stats.skipped += 1,
            SubTaskStatus::Cancelled => stats.cancelled += 1,
        }
    }
    if levels > 0 {
        stats.parallel_efficiency = outcomes.len() as f64 / levels as f64;
    }
    stats
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tw_core::AgentKind;

    fn spec(id: &str, deps: &[&str]) -> SubTaskSpec {
        SubTaskSpec {
            id: id.into(),
            agent: AgentKind::Explore,
            task: format!("do {id}"),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: None,
        }
    }

    struct RecordingRunner {
        /// Sub-task ids that should fail.
        failing: HashSet<String>,
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl RecordingRunner {
        fn new(failing: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl SubTaskRunner for RecordingRunner {
        async fn run(&self, spec: SubTaskSpec, _context: TaskContext) -> TaskResult {
            self.started.lock().unwrap().push(spec.id.clone());
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(&spec.id) {
                TaskResult::err(TaskError::new(ErrorCode::AgentError, "scripted failure"))
            } else {
                TaskResult::ok(format!("done {}", spec.id)).with_artifacts(vec![spec.id])
            }
        }
    }

    fn executor(config: ParallelConfig) -> ParallelExecutor {
        ParallelExecutor::new(config, EventBus::new())
    }

    // -- graph building --

    #[test]
    fn levels_respect_dependencies() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &[]),
            spec("c", &["a", "b"]),
            spec("d", &["c"]),
        ];
        let levels = build_levels(&specs).unwrap();
        assert_eq!(levels, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn topological_correctness_no_same_or_later_level_deps() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
            spec("e", &["a"]),
        ];
        let levels = build_levels(&specs).unwrap();
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        for (n, level) in levels.iter().enumerate() {
            for &i in level {
                level_of.insert(specs[i].id.as_str(), n);
            }
        }
        for s in &specs {
            for dep in &s.dependencies {
                assert!(
                    level_of[dep.as_str()] < level_of[s.id.as_str()],
                    "dep {dep} of {} not in earlier level",
                    s.id
                );
            }
        }
    }

    #[test]
    fn graph_validation_errors() {
        assert_eq!(build_levels(&[]), Err(GraphError::Empty));

        let dup = vec![spec("a", &[]), spec("a", &[])];
        assert!(matches!(
            build_levels(&dup),
            Err(GraphError::DuplicateId(_))
        ));

        let selfy = vec![spec("a", &["a"])];
        assert!(matches!(
            build_levels(&selfy),
            Err(GraphError::SelfDependency(_))
        ));

        let unknown = vec![spec("a", &["ghost"])];
        assert!(matches!(
            build_levels(&unknown),
            Err(GraphError::UnknownDependency { .. })
        ));

        let forward = vec![spec("a", &["b"]), spec("b", &[])];
        assert!(matches!(
            build_levels(&forward),
            Err(GraphError::ForwardDependency { .. })
        ));
    }

    // -- execution --

    #[tokio::test]
    async fn linear_chain_runs_in_three_levels() {
        let specs = vec![spec("analyze", &[]), spec("code", &["analyze"]), spec("test", &["code"])];
        let runner = RecordingRunner::new(&[], Duration::from_millis(5));

        let report = executor(ParallelConfig::default())
            .execute(
                "parent",
                &TaskContext::default(),
                specs,
                runner.clone(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.stats.levels, 3);
        assert_eq!(report.stats.successful, 3);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(
            *runner.started.lock().unwrap(),
            vec!["analyze", "code", "test"]
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let specs: Vec<SubTaskSpec> = (0..20).map(|i| spec(&format!("s{i}"), &[])).collect();
        let runner = RecordingRunner::new(&[], Duration::from_millis(15));

        let report = executor(ParallelConfig {
            max_concurrency: 3,
            ..Default::default()
        })
        .execute(
            "parent",
            &TaskContext::default(),
            specs,
            runner.clone(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.stats.successful, 20);
        assert!(runner.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn independent_sub_tasks_overlap_in_time() {
        let specs = vec![spec("a", &[]), spec("b", &[])];
        let runner = RecordingRunner::new(&[], Duration::from_millis(50));

        let started = std::time::Instant::now();
        executor(ParallelConfig::default())
            .execute(
                "parent",
                &TaskContext::default(),
                specs,
                runner,
                CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "two independent 50ms tasks must overlap"
        );
    }

    #[tokio::test]
    async fn priority_orders_kick_off_within_level() {
        let mut low = spec("low", &[]);
        low.priority = Some(1);
        let mut high = spec("high", &[]);
        high.priority = Some(10);

        let runner = RecordingRunner::new(&[], Duration::from_millis(1));
        executor(ParallelConfig {
            max_concurrency: 1,
            ..Default::default()
        })
        .execute(
            "parent",
            &TaskContext::default(),
            vec![low, high],
            runner.clone(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(*runner.started.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn failed_dependency_skips_descendants() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("d", &[]),
        ];
        let runner = RecordingRunner::new(&["a"], Duration::from_millis(1));

        let report = executor(ParallelConfig::default())
            .execute(
                "parent",
                &TaskContext::default(),
                specs,
                runner.clone(),
                CancelToken::new(),
            )
            .await
            .unwrap();

        let by_id: HashMap<&str, &SubTaskOutcome> = report
            .outcomes
            .iter()
            .map(|o| (o.spec.id.as_str(), o))
            .collect();
        assert_eq!(by_id["a"].status, SubTaskStatus::Failed);
        assert_eq!(by_id["b"].status, SubTaskStatus::Skipped);
        assert_eq!(by_id["c"].status, SubTaskStatus::Skipped);
        assert_eq!(by_id["d"].status, SubTaskStatus::Succeeded);
        // Skipped sub-tasks never reach the runner.
        let started = runner.started.lock().unwrap().clone();
        assert!(!started.contains(&"b".to_string()));
        assert!(!started.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn continue_on_error_false_aborts_later_levels() {
        let specs = vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])];
        let runner = RecordingRunner::new(&["a"], Duration::from_millis(1));

        let report = executor(ParallelConfig {
            continue_on_error: false,
            ..Default::default()
        })
        .execute(
            "parent",
            &TaskContext::default(),
            specs,
            runner,
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.skipped, 2);
    }

    #[tokio::test]
    async fn per_sub_task_timeout_marks_failure() {
        let specs = vec![spec("slow", &[])];
        let runner = RecordingRunner::new(&[], Duration::from_millis(200));

        let report = executor(ParallelConfig {
            task_timeout: Duration::from_millis(20),
            ..Default::default()
        })
        .execute(
            "parent",
            &TaskContext::default(),
            specs,
            runner,
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.stats.failed, 1);
        let error = report.outcomes[0]
            .result
            .as_ref()
            .unwrap()
            .error_code()
            .unwrap();
        assert_eq!(error, ErrorCode::ToolTimeout);
    }

    #[tokio::test]
    async fn cancellation_preserves_completed_results() {
        let specs = vec![spec("first", &[]), spec("second", &["first"])];
        let runner = RecordingRunner::new(&[], Duration::from_millis(30));
        let cancel = CancelToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            cancel_clone.cancel();
        });

        let report = executor(ParallelConfig {
            max_concurrency: 1,
            ..Default::default()
        })
        .execute(
            "parent",
            &TaskContext::default(),
            specs,
            runner,
            cancel,
        )
        .await
        .unwrap();

        let by_id: HashMap<&str, &SubTaskOutcome> = report
            .outcomes
            .iter()
            .map(|o| (o.spec.id.as_str(), o))
            .collect();
        assert_eq!(by_id["first"].status, SubTaskStatus::Succeeded);
        assert_eq!(by_id["second"].status, SubTaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn stats_and_efficiency() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &[]),
            spec("c", &[]),
            spec("d", &["a"]),
        ];
        let runner = RecordingRunner::new(&[], Duration::from_millis(1));

        let report = executor(ParallelConfig::default())
            .execute(
                "parent",
                &TaskContext::default(),
                specs,
                runner,
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.stats.total, 4);
        assert_eq!(report.stats.levels, 2);
        assert!((report.stats.parallel_efficiency - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn progress_and_level_events_fire() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let exec = ParallelExecutor::new(ParallelConfig::default(), bus);

        let progress_seen = Arc::new(AtomicUsize::new(0));
        let progress_clone = Arc::clone(&progress_seen);
        let exec = exec.with_hooks(ProgressHooks {
            on_progress: Some(Box::new(move |completed, _total, _outcome| {
                progress_clone.fetch_max(completed, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        let specs = vec![spec("a", &[]), spec("b", &["a"])];
        exec.execute(
            "parent",
            &TaskContext::default(),
            specs,
            RecordingRunner::new(&[], Duration::from_millis(1)),
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(progress_seen.load(Ordering::SeqCst), 2);

        let mut level_starts = 0;
        let mut level_completes = 0;
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                RuntimeEvent::LevelStarted { .. } => level_starts += 1,
                RuntimeEvent::LevelCompleted { .. } => level_completes += 1,
                _ => {}
            }
        }
        assert_eq!(level_starts, 2);
        assert_eq!(level_completes, 2);
    }

    #[tokio::test]
    async fn artifacts_aggregate_from_successes_only() {
        let specs = vec![spec("good", &[]), spec("bad", &[])];
        let runner = RecordingRunner::new(&["bad"], Duration::from_millis(1));

        let report = executor(ParallelConfig::default())
            .execute(
                "parent",
                &TaskContext::default(),
                specs,
                runner,
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.artifacts(), vec!["good".to_string()]);
    }
}
