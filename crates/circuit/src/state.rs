//! Per-circuit state machine.
//!
//! All mutation happens behind the registry's per-circuit lock; every method
//! takes `now` explicitly so the machine is deterministic under test.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Position of a circuit in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Tuning knobs for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// Probe successes in `HalfOpen` before the circuit closes again.
    pub success_threshold: u32,
    /// Time spent `Open` before the next call may probe.
    pub open_timeout: Duration,
    /// Concurrent probes admitted while `HalfOpen`.
    pub half_open_limit: u32,
}

impl Default for CircuitConfig {
    /// Defaults applied when a circuit is invoked before explicit
    /// registration. Integrators rely on these values existing out of the
    /// box: 5 failures to open, 3 successes to close, 30s open timeout,
    /// 3 concurrent probes.
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::milliseconds(30_000),
            half_open_limit: 3,
        }
    }
}

impl CircuitConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_limit(mut self, limit: u32) -> Self {
        self.half_open_limit = limit.max(1);
        self
    }
}

/// Point-in-time snapshot of a circuit, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
}

/// A state change to be published as an observable event.
pub(crate) type Transition = (CircuitState, CircuitState);

/// Mutable state of one named circuit.
///
/// Invariants: `failure_count`/`success_count` reset to zero on every state
/// transition; `half_open_in_flight` resets only on entry into `HalfOpen`.
#[derive(Debug)]
pub(crate) struct Circuit {
    name: String,
    config: CircuitConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
}

impl Circuit {
    pub(crate) fn new(name: impl Into<String>, config: CircuitConfig, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            last_failure_at: None,
            last_state_change_at: now,
        }
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        if to == CircuitState::HalfOpen {
            self.half_open_in_flight = 0;
        }
        self.last_state_change_at = now;
        (from, to)
    }

    /// Decide whether a call may proceed.
    ///
    /// May move `Open → HalfOpen` when the open timeout has elapsed; the
    /// admitted call then counts as the first probe. The check and the
    /// in-flight increment happen under one lock acquisition, so probes
    /// beyond `half_open_limit` are rejected, not counted after the fact.
    pub(crate) fn try_admit(&mut self, now: DateTime<Utc>) -> (bool, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if now - self.last_state_change_at >= self.config.open_timeout {
                    let transition = self.transition(CircuitState::HalfOpen, now);
                    self.half_open_in_flight = 1;
                    (true, Some(transition))
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_limit {
                    self.half_open_in_flight += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                // A success ends any failure streak.
                self.failure_count = 0;
                self.success_count += 1;
                None
            }
            // A probe that raced a reopen; its outcome is no longer relevant.
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    Some(self.transition(CircuitState::Closed, now))
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                self.success_count = 0;
                if self.failure_count >= self.config.failure_threshold {
                    Some(self.transition(CircuitState::Open, now))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
            // No partial credit: one failed probe reopens the circuit.
            CircuitState::HalfOpen => Some(self.transition(CircuitState::Open, now)),
        }
    }

    /// Operator override: force `Closed` with zeroed counters, regardless of
    /// the current state.
    pub(crate) fn force_closed(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;
        let transition = self.transition(CircuitState::Closed, now);
        self.half_open_in_flight = 0;
        self.last_failure_at = None;
        (from != CircuitState::Closed).then_some(transition)
    }

    pub(crate) fn snapshot(&self) -> CircuitStatus {
        CircuitStatus {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_in_flight: self.half_open_in_flight,
            last_failure_at: self.last_failure_at,
            last_state_change_at: self.last_state_change_at,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }
}
