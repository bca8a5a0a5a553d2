use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tw_core::config::CircuitConfig;
use tw_core::AgentKind;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Too many failures; calls are rejected until the cool-down elapses.
    Open,
    /// Cool-down elapsed; exactly one probe call is allowed through.
    HalfOpen,
}

/// Read-only view of a breaker for diagnostics and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Inner state (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    consecutive_failures: u32,
    failure_count: u32,
    success_count: u32,
    /// Sliding window of recent outcomes; `true` = failure.
    window: VecDeque<bool>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    opened_at_instant: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    /// Reserved while the single half-open probe is outstanding.
    probe_in_flight: bool,
}

impl InnerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_count: 0,
            success_count: 0,
            window: VecDeque::new(),
            last_failure: None,
            last_success: None,
            opened_at_instant: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn push_outcome(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at_instant = Some(Instant::now());
        self.opened_at = Some(Utc::now());
        self.probe_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Per-collaborator health state machine.
///
/// `record_success` and `record_failure` are the only mutators; `is_allowed`
/// has no side effects beyond the timed open→half-open transition and the
/// reservation of the single half-open probe.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(InnerState::new())),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Whether a call may be attempted right now.
    ///
    /// Open circuits transition to half-open once the cool-down has elapsed;
    /// in half-open exactly one caller gets `true` until the probe outcome is
    /// recorded.
    pub fn is_allowed(&self) -> bool {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooldown = Duration::from_millis(self.config.cooldown_ms);
                let elapsed = guard
                    .opened_at_instant
                    .map(|t| t.elapsed() >= cooldown)
                    .unwrap_or(true);
                if elapsed {
                    info!("circuit transitioning open -> half_open");
                    guard.state = CircuitState::HalfOpen;
                    guard.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    false
                } else {
                    guard.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        guard.success_count += 1;
        guard.last_success = Some(Utc::now());
        guard.push_outcome(false, self.config.window);
        match guard.state {
            CircuitState::HalfOpen => {
                info!("circuit transitioning half_open -> closed");
                guard.state = CircuitState::Closed;
                guard.consecutive_failures = 0;
                guard.probe_in_flight = false;
                guard.opened_at_instant = None;
                guard.opened_at = None;
            }
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            }
            CircuitState::Open => { /* stale result after opening; ignore */ }
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        guard.failure_count += 1;
        guard.consecutive_failures += 1;
        guard.last_failure = Some(Utc::now());
        guard.push_outcome(true, self.config.window);
        match guard.state {
            CircuitState::Closed => {
                let rate_tripped = guard.window.len() >= self.config.window
                    && guard.window_failure_rate() >= self.config.failure_rate_threshold;
                if guard.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        consecutive = guard.consecutive_failures,
                        rate = guard.window_failure_rate(),
                        "circuit transitioning closed -> open"
                    );
                    guard.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit transitioning half_open -> open (probe failed)");
                guard.open();
            }
            CircuitState::Open => { /* already open */ }
        }
    }

    /// Give back a half-open probe reservation without recording an outcome.
    /// For the rare case where the call never actually ran (e.g. the target
    /// turned out to be busy): the next `is_allowed` may probe again.
    pub fn release_probe(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        if guard.state == CircuitState::HalfOpen {
            guard.probe_in_flight = false;
        }
    }

    /// Manually reset to closed, clearing all counters.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().expect("breaker lock poisoned");
        *guard = InnerState::new();
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let guard = self.inner.lock().expect("breaker lock poisoned");
        CircuitSnapshot {
            state: guard.state,
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            last_failure: guard.last_failure,
            last_success: guard.last_success,
            opened_at: guard.opened_at,
        }
    }

    /// Remaining cool-down before the next probe, if the circuit is open.
    pub fn retry_after(&self) -> Option<Duration> {
        let guard = self.inner.lock().expect("breaker lock poisoned");
        if guard.state != CircuitState::Open {
            return None;
        }
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        guard
            .opened_at_instant
            .map(|t| cooldown.saturating_sub(t.elapsed()))
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide directory of one breaker per agent kind.
pub struct BreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<AgentKind, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, agent: AgentKind) -> CircuitBreaker {
        self.breakers
            .entry(agent)
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()))
            .clone()
    }

    pub fn is_allowed(&self, agent: AgentKind) -> bool {
        self.breaker(agent).is_allowed()
    }

    pub fn record_success(&self, agent: AgentKind) {
        self.breaker(agent).record_success();
    }

    pub fn record_failure(&self, agent: AgentKind) {
        self.breaker(agent).record_failure();
    }

    pub fn snapshot(&self, agent: AgentKind) -> CircuitSnapshot {
        self.breaker(agent).snapshot()
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
