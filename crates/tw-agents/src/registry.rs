use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tw_core::{AgentKind, AgentState};

use crate::agent::Agent;

// ---------------------------------------------------------------------------
// AgentInfo
// ---------------------------------------------------------------------------

/// What an agent advertises to the orchestrator's analysis prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub kind: AgentKind,
    pub name: String,
    pub description: String,
    pub state: AgentState,
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Process-wide directory of agents by kind.
///
/// The registry does not own agent lifecycles beyond the process: the host
/// constructs agents once, registers them, and drops the registry at
/// shutdown. Availability is advisory -- callers must still handle an agent
/// turning busy between the check and the call.
pub struct AgentRegistry {
    agents: DashMap<AgentKind, Arc<Agent>>,
    /// Bumped on every registration change so caches keyed on the agent set
    /// (e.g. the routing cache) can detect staleness.
    generation: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the agent for a kind.
    pub fn register(&self, agent: Arc<Agent>) {
        debug!(agent = agent.name(), "registered agent");
        self.agents.insert(agent.kind(), agent);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregister(&self, kind: AgentKind) -> Option<Arc<Agent>> {
        let removed = self.agents.remove(&kind).map(|(_, agent)| agent);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<Agent>> {
        self.agents.get(&kind).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_available(&self, kind: AgentKind) -> bool {
        self.agents
            .get(&kind)
            .map(|entry| entry.is_available())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Current registration generation; changes whenever the agent set does.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Info for every registered agent, in stable kind order.
    pub fn agents_info(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .iter()
            .map(|entry| AgentInfo {
                kind: entry.kind(),
                name: entry.name().to_string(),
                description: entry.description().to_string(),
                state: entry.state(),
            })
            .collect();
        infos.sort_by_key(|info| AgentKind::ALL.iter().position(|k| *k == info.kind));
        infos
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
