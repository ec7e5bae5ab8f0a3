use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use strum::Display;

use crate::error::JudgmentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before trial calls are admitted.
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open; that many successes close it.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trials_admitted: u32,
    trial_successes: u32,
}

/// Failure-counting guard around one protected call type.
///
/// Shared by every worker through an `Arc`; all transitions happen under the
/// internal mutex. Callers ask for admission with [`try_acquire`](Self::try_acquire)
/// and must report the outcome of every admitted call.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                half_open_max_calls: config.half_open_max_calls.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                trials_admitted: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Admit a call, or fail fast while the circuit is open.
    pub fn try_acquire(&self) -> Result<(), JudgmentError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed < self.config.recovery_timeout {
                    return Err(JudgmentError::CircuitOpen(self.name.clone()));
                }
                tracing::info!(breaker = self.name.as_str(), "circuit half-open, admitting trial call");
                inner.state = BreakerState::HalfOpen;
                inner.trials_admitted = 1;
                inner.trial_successes = 0;
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.trials_admitted >= self.config.half_open_max_calls {
                    return Err(JudgmentError::CircuitOpen(self.name.clone()));
                }
                inner.trials_admitted += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_max_calls {
                    tracing::info!(breaker = self.name.as_str(), "circuit closed");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.opened_at = None;
                }
            }
            // A straggler admitted before the circuit opened.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = self.name.as_str(),
                        failures = inner.failure_count,
                        "failure threshold reached, circuit open"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = self.name.as_str(), "trial call failed, circuit re-opened");
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
        }
    }
}
