//! Circuit breaker pattern for dependency protection.
//!
//! Prevents cascading failures by counting failures inside a sliding window
//! and temporarily refusing calls to a dependency that keeps failing.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_abstraction::Clock;
use tracing::{debug, info, warn};

use crate::error::{GuardError, ResilienceError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time the circuit stays open before allowing trial calls.
    pub open_timeout: Duration,
    /// Sliding window over which failures are counted.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,
    /// Circuit is open, requests are rejected without reaching the dependency.
    Open,
    /// Circuit is testing whether the dependency has recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps inside the window (closed state only).
    failures: VecDeque<DateTime<Utc>>,
    /// Consecutive successes while half-open.
    success_count: u32,
    opened_at: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single dependency.
///
/// Transitions:
/// - Closed → Open: `failure_threshold` failures within `failure_window`
/// - Open → HalfOpen: `open_timeout` elapsed since the circuit opened
/// - HalfOpen → Closed: `success_threshold` consecutive successes
/// - HalfOpen → Open: any failure
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `dependency`.
    pub fn new(
        dependency: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            dependency: dependency.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                success_count: 0,
                opened_at: None,
                last_transition: now,
            }),
        }
    }

    /// Name of the protected dependency.
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying any due Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    /// Checks whether a call may proceed right now.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` while the circuit is open.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        match self.state() {
            CircuitState::Open => {
                Err(ResilienceError::CircuitOpen { dependency: self.dependency.clone() })
            }
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Runs `op` through the breaker. Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Runs `op` through the breaker, counting only errors for which
    /// `counts_as_failure` returns true.
    ///
    /// Errors that do not indict the dependency (bad input, for example) are
    /// treated as a successful response from it.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.try_acquire()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if counts_as_failure(&err) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(GuardError::Failed(err))
            }
        }
    }

    /// Runs `op`, or `fallback` instead when the circuit is open.
    ///
    /// The fallback's outcome does not touch the breaker counters.
    pub async fn call_or_else<F, Fut, G, GFut, T, E>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        if self.try_acquire().is_err() {
            debug!(dependency = %self.dependency, "Circuit open, using fallback");
            return fallback().await.map_err(GuardError::Failed);
        }
        self.call(op).await
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                Self::prune(&mut inner.failures, now, self.config.failure_window);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        dependency = %self.dependency,
                        successes = inner.success_count,
                        "Circuit breaker closing after successful recovery"
                    );
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                // A call that started before the trip finished late.
                debug!(dependency = %self.dependency, "Success recorded while circuit open");
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                Self::prune(&mut inner.failures, now, self.config.failure_window);
                let failures = inner.failures.len() as u32;

                if failures >= self.config.failure_threshold {
                    warn!(
                        dependency = %self.dependency,
                        failures = failures,
                        window_ms = self.config.failure_window.as_millis() as u64,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    dependency = %self.dependency,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the circuit into `new_state`.
    pub fn force_state(&self, new_state: CircuitState) {
        let now = self.clock.now();
        let mut inner = self.lock();
        info!(
            dependency = %self.dependency,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        self.transition(&mut inner, new_state, now);
    }

    /// Resets the breaker to the closed state.
    pub fn reset(&self) {
        self.force_state(CircuitState::Closed);
    }

    /// Snapshot of the breaker's counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        Self::prune(&mut inner.failures, now, self.config.failure_window);

        CircuitBreakerStats {
            dependency: self.dependency.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.success_count,
            opened_at: inner.opened_at,
            last_transition: inner.last_transition,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the Open → HalfOpen transition once the open timeout has passed.
    fn refresh(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };

        let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.config.open_timeout {
            info!(
                dependency = %self.dependency,
                "Circuit breaker transitioning to half-open after timeout"
            );
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn prune(failures: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
        while let Some(&oldest) = failures.front() {
            let age = (now - oldest).to_std().unwrap_or(Duration::ZERO);
            if age > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState, now: DateTime<Utc>) {
        debug!(
            dependency = %self.dependency,
            from = %inner.state,
            to = %new_state,
            "Circuit breaker transition"
        );
        inner.state = new_state;
        inner.last_transition = now;
        inner.success_count = 0;

        match new_state {
            CircuitState::Closed => {
                inner.failures.clear();
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.failures.clear();
                inner.opened_at = Some(now);
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Protected dependency.
    pub dependency: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures currently inside the window.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    /// When the circuit last opened, if it is open or half-open.
    pub opened_at: Option<DateTime<Utc>>,
    /// Time of last state transition.
    pub last_transition: DateTime<Utc>,
}
