//! Circuit breaker guarding the persistence backend
//!
//! ```text
//! Closed   -> Open      failure_threshold consecutive failed batches
//! Open     -> HalfOpen  recovery_timeout elapsed; next batch is the trial
//! HalfOpen -> Closed    trial succeeded, failure counter reset
//! HalfOpen -> Open      trial failed, recovery timer restarts
//! ```
//!
//! Owned by the batch writer; only the transition methods change state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn from_gauge(v: i64) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

/// What the writer may do with its next batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal commit with retries
    Allowed,
    /// Single attempt, no retries
    Trial,
    /// No backend calls until the recovery deadline
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition: now,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => Admission::Trial,
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(self.last_transition);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(CircuitState::HalfOpen, now);
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.config.recovery_timeout - elapsed,
                    }
                }
            }
        }
    }

    /// Returns the new state when the call changed it
    pub fn on_success(&mut self, now: Instant) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed, now);
            return Some(CircuitState::Closed);
        }
        None
    }

    /// Returns `Some(Open)` when this failure opened the circuit
    pub fn on_failure(&mut self, now: Instant) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open, now);
                Some(CircuitState::Open)
            }
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.transition(CircuitState::Open, now);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        tracing::info!(from = %self.state, to = %to, failures = self.consecutive_failures, "Circuit breaker transition");
        self.state = to;
        self.last_transition = now;
    }
}
