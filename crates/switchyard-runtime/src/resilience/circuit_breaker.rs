//! Circuit breaker to prevent cascade failures.
//!
//! When a backend fails repeatedly, its circuit opens and subsequent
//! calls are rejected without touching the backend, so the fallback
//! chain moves straight to the next one. After `recovery_timeout` has
//! elapsed since the last failure the circuit lets a bounded number of
//! trial calls through (half-open) to probe recovery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{duration_secs, ConfigError};

/// Successes needed while half-open before the circuit closes again.
pub const DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD: u32 = 1;

/// Trial calls allowed in flight while half-open.
pub const DEFAULT_HALF_OPEN_MAX_TRIALS: u32 = 1;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time since the last failure before attempting recovery
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close circuit
    pub half_open_success_threshold: u32,

    /// Concurrent trial calls permitted while half-open
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_success_threshold: DEFAULT_HALF_OPEN_SUCCESS_THRESHOLD,
            half_open_max_trials: DEFAULT_HALF_OPEN_MAX_TRIALS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ConfigError::invalid(
                "half_open_success_threshold",
                "must be at least 1",
            ));
        }
        if self.half_open_max_trials == 0 {
            return Err(ConfigError::invalid("half_open_max_trials", "must be at least 1"));
        }
        Ok(())
    }
}

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Circuit is open, all calls rejected
    Open,

    /// Testing if circuit can close
    HalfOpen,
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

/// A call was rejected without invoking the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit {state} for backend '{backend}'")]
pub struct CircuitOpenError {
    pub backend: String,
    pub state: CircuitState,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure: Option<Instant>,
    pub times_opened: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { successes: u32, in_flight: u32 },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    times_opened: u64,
    /// Bumped on every Open → HalfOpen transition
    epoch: u64,
}

/// Per-backend circuit breaker.
///
/// All bookkeeping happens under one short-lived lock; the lock is never
/// held while the backend is called.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named backend.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                consecutive_failures: 0,
                last_failure: None,
                times_opened: 0,
                epoch: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to make one call.
    ///
    /// Closed circuits always grant a permit. Half-open circuits grant one
    /// while fewer than `half_open_max_trials` trials are in flight.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.poll_recovery(&mut inner);

        let phase = inner.phase;
        match phase {
            Phase::Closed => Ok(CallPermit::new(self, None)),
            Phase::HalfOpen {
                successes,
                in_flight,
            } if in_flight < self.config.half_open_max_trials => {
                inner.phase = Phase::HalfOpen {
                    successes,
                    in_flight: in_flight + 1,
                };
                Ok(CallPermit::new(self, Some(inner.epoch)))
            }
            Phase::HalfOpen { .. } | Phase::Open { .. } => Err(CircuitOpenError {
                backend: self.name.clone(),
                state: state_of(phase),
            }),
        }
    }

    /// Check if calls are currently rejected.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.poll_recovery(&mut inner);
        match inner.phase {
            Phase::Open { .. } => true,
            Phase::HalfOpen { in_flight, .. } => in_flight >= self.config.half_open_max_trials,
            Phase::Closed => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.on_failure();
    }

    /// Current state, applying a due Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.poll_recovery(&mut inner);
        state_of(inner.phase)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.poll_recovery(&mut inner);
        BreakerSnapshot {
            state: state_of(inner.phase),
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: match inner.phase {
                Phase::HalfOpen { successes, .. } => successes,
                _ => 0,
            },
            last_failure: inner.last_failure,
            times_opened: inner.times_opened,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Reset circuit to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    fn poll_recovery(&self, inner: &mut Inner) {
        if let Phase::Open { since } = inner.phase {
            if since.elapsed() >= self.config.recovery_timeout {
                inner.phase = Phase::HalfOpen {
                    successes: 0,
                    in_flight: 0,
                };
                inner.epoch += 1;
                tracing::info!(
                    backend = %self.name,
                    "Circuit transitioning to half-open for recovery test"
                );
            }
        }
    }

    /// `trial` is the half-open episode a trial permit was issued in.
    fn on_success(&self, trial: Option<u64>) {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        match phase {
            Phase::HalfOpen { .. } if trial.is_some_and(|epoch| epoch != inner.epoch) => {
                tracing::debug!(
                    backend = %self.name,
                    "Ignoring success from an earlier recovery trial"
                );
            }
            Phase::HalfOpen {
                successes,
                in_flight,
            } => {
                let in_flight = if trial.is_some() {
                    in_flight.saturating_sub(1)
                } else {
                    in_flight
                };
                if successes + 1 >= self.config.half_open_success_threshold {
                    inner.phase = Phase::Closed;
                    inner.consecutive_failures = 0;
                    tracing::info!(
                        backend = %self.name,
                        "Circuit closed after successful recovery"
                    );
                } else {
                    inner.phase = Phase::HalfOpen {
                        successes: successes + 1,
                        in_flight,
                    };
                }
            }
            Phase::Closed => {
                inner.consecutive_failures = 0;
            }
            Phase::Open { .. } => {
                // A call admitted before the circuit opened finished late.
                tracing::debug!(backend = %self.name, "Ignoring success while circuit is open");
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        let phase = inner.phase;
        match phase {
            Phase::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.phase = Phase::Open { since: now };
                    inner.times_opened += 1;
                    tracing::warn!(
                        backend = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            Phase::HalfOpen { .. } => {
                // Failed during recovery, reopen; in-flight trials are void
                inner.phase = Phase::Open { since: now };
                inner.times_opened += 1;
                tracing::warn!(
                    backend = %self.name,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            Phase::Open { .. } => {
                inner.phase = Phase::Open { since: now };
            }
        }
    }

    fn release_trial(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        let phase = inner.phase;
        if let Phase::HalfOpen {
            successes,
            in_flight,
        } = phase
        {
            if epoch != inner.epoch {
                return;
            }
            inner.phase = Phase::HalfOpen {
                successes,
                in_flight: in_flight.saturating_sub(1),
            };
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn state_of(phase: Phase) -> CircuitState {
    match phase {
        Phase::Closed => CircuitState::Closed,
        Phase::Open { .. } => CircuitState::Open,
        Phase::HalfOpen { .. } => CircuitState::HalfOpen,
    }
}

/// Permission for one call, settled with [`success`](Self::success) or
/// [`failure`](Self::failure).
///
/// Dropping an unsettled permit (e.g. a cancelled call) frees its
/// half-open trial slot without crediting an outcome. A trial permit only
/// affects the half-open episode that issued it.
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: Option<u64>) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is a half-open recovery trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let (false, Some(epoch)) = (self.settled, self.trial) {
            self.breaker.release_trial(epoch);
        }
    }
}
