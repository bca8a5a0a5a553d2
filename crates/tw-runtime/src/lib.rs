//! The taskweave orchestration engine.
//!
//! Wires the decision loop, the dependency-aware parallel executor, the
//! per-agent circuit breakers, the checkpoint scheduler, and the
//! persistence-backed task/dead-letter lifecycle into one runtime.

pub mod cancel;
pub mod checkpoint;
pub mod dead_letter;
pub mod maintenance;
pub mod orchestrator;
pub mod parallel;
pub mod routing_cache;

pub use cancel::CancelToken;
pub use checkpoint::{CheckpointScheduler, CheckpointStats, StateProvider, Trigger};
pub use dead_letter::{AutoRetryConfig, DeadLetterQueue, DlqError};
pub use maintenance::spawn_cleanup_task;
pub use orchestrator::Orchestrator;
pub use parallel::{
    build_levels, ExecutionReport, ExecutionStats, GraphError, ParallelConfig, ParallelExecutor,
    ProgressHooks, SubTaskOutcome, SubTaskRunner, SubTaskStatus,
};
pub use routing_cache::RoutingCache;
