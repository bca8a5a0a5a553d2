//! Broadcast event bus for runtime observers.
//!
//! Built on flume channels: each subscriber gets its own unbounded receiver,
//! and disconnected subscribers are pruned on publish. Cloning the bus is
//! cheap and all clones share the subscriber list.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentKind, CheckpointReason};

// ---------------------------------------------------------------------------
// RuntimeEvent
// ---------------------------------------------------------------------------

/// Events published at the runtime's observable transitions. Observer
/// callbacks on individual components stay available; the bus exists so
/// external consumers do not have to register closures everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    TaskQueued { task_id: String },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, code: String },
    DecisionMade { task_id: String, action: String },
    DelegationStarted { task_id: String, agent: AgentKind },
    DelegationFinished { task_id: String, agent: AgentKind, success: bool },
    LevelStarted { task_id: String, level: usize, count: usize },
    LevelCompleted { task_id: String, level: usize, succeeded: usize, failed: usize },
    SubTaskProgress { task_id: String, completed: usize, total: usize },
    CheckpointCreated { task_id: String, checkpoint_id: String, reason: CheckpointReason },
    CircuitOpened { agent: AgentKind },
    DeadLetterAdded { entry_id: String, task_id: String },
    DeadLetterRetried { entry_id: String, task_id: String },
    DeadLetterPurged { count: usize },
    TaskCancelled { task_id: String },
}

/// An event with its publication timestamp, as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: RuntimeEvent,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EventEnvelope>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber; it receives every event published afterwards.
    pub fn subscribe(&self) -> flume::Receiver<EventEnvelope> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish to all subscribers, pruning the disconnected ones.
    pub fn publish(&self, event: RuntimeEvent) {
        let envelope = EventEnvelope {
            event,
            timestamp: Utc::now(),
        };
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
