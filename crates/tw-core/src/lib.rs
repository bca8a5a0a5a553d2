//! Core data model for the taskweave orchestration runtime.
//!
//! This crate holds everything the other layers share: the task model and its
//! status machine, orchestration decisions, checkpoints, dead-letter entries,
//! the error taxonomy, agent messages with bounded history, the context
//! compressor, runtime configuration, and the broadcast event bus.

pub mod compressor;
pub mod config;
pub mod events;
pub mod message;
pub mod types;

pub use compressor::{CompressorConfig, ContextCompressor};
pub use config::{Config, ConfigError, ExecutionMode};
pub use events::{EventBus, EventEnvelope, RuntimeEvent};
pub use message::{AgentMessage, MessageHistory, MessageRole, ToolCall, ToolResult};
pub use types::{
    AgentKind, AgentState, Checkpoint, CheckpointReason, DeadLetterEntry, Decision, ErrorCode,
    LogLevel, SubTaskDraft, SubTaskSpec, Task, TaskContext, TaskError, TaskKind, TaskLogEntry,
    TaskMetadata, TaskResult, TaskStateError, TaskStatus, MAX_DECOMPOSITION_DEPTH, SCHEMA_VERSION,
};
