//! Tool layer for the taskweave runtime.
//!
//! Holds the tool wire types and registry, the bounded-parallel tool
//! executor, the execution-mode permission guard, the dry-run manager, the
//! per-agent circuit breaker, and the capability traits the core consumes
//! from its host.

pub mod capabilities;
pub mod circuit_breaker;
pub mod dry_run;
pub mod executor;
pub mod mode_guard;
pub mod registry;
pub mod tool;

pub use capabilities::{
    Analysis, CapabilityError, CodeAnalyzer, ConnectorInfo, DirEntry, FileSystem,
    IntegrationConnectorsState, MemoryFileSystem, ProcessInfo, ScreenshotService, SearchHit,
    Shell, ShellOutput, TestRunOutcome, TestRunner, WebSearch, WritableFileSystem,
};
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use dry_run::{DryRunError, DryRunManager, DryRunSummary, SimulatedOperation};
pub use executor::{ExecutorConfig, ToolExecutor, ToolObserver};
pub use mode_guard::{ApprovalCallback, ExecutionModeGuard, Permission};
pub use registry::{
    RegisterOptions, RegistryError, RegistryStats, ToolOutcome, ToolRegistry, ToolStats,
};
pub use tool::{FnHandler, ToolCategory, ToolDefinition, ToolError, ToolHandler};
