//! Agents for the taskweave runtime.
//!
//! One generic tool-calling loop (ask the oracle, run the requested tools,
//! append to history, repeat), specialised per agent kind through role
//! profiles and a handful of layered behaviours: file snapshots with
//! rollback, post-fix verification, memoised review analysis, test history,
//! and command tracking.

pub mod agent;
pub mod oracle;
pub mod registry;
pub mod roles;

pub use agent::{Agent, AgentBuilder};
pub use oracle::{DecisionOracle, OracleError, OracleReply};
pub use registry::{AgentInfo, AgentRegistry};
pub use roles::{CommandLog, FileSnapshotSet, ReviewMemo, RoleProfile, TestHistory};
