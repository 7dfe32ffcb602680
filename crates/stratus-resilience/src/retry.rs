//! Retry policy with exponential backoff.
//!
//! One policy type serves both retry tiers: the immediate base tier used
//! around a single agent call and the escalated tier with exponential,
//! jittered delays used once a dependency looks unhealthy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use stratus_abstraction::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub base: f64,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl RetryConfig {
    /// Small, immediate retry used inside the step executor.
    #[must_use]
    pub fn base_tier() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            base: 1.0,
            jitter: false,
        }
    }

    /// Exponential backoff used once the base tier is exhausted on an
    /// environmental failure.
    #[must_use]
    pub fn escalated_tier() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            base: 2.0,
            jitter: true,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::base_tier() }
    }

    /// Calculate the unjittered delay after failed attempt `attempt` (1-based).
    ///
    /// Uses exponential backoff: `initial_delay * base^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.base.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::escalated_tier()
    }
}

/// What happened while retrying an operation.
#[derive(Debug)]
pub struct RetryReport<T, E> {
    /// Final outcome: the first success, or the last error.
    pub result: Result<T, E>,
    /// Attempts made.
    pub attempts: u32,
    /// Errors from attempts before the final one.
    pub failures: Vec<E>,
    /// Delays slept between attempts.
    pub delays: Vec<Duration>,
    /// The cancellation token fired during a backoff sleep.
    pub cancelled: bool,
}

impl<T, E> RetryReport<T, E> {
    /// Returns the final outcome, discarding the history.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Executes operations with retries according to a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    /// Creates a retry policy that sleeps through `clock`.
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// The policy's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to sleep after failed attempt `attempt`, jittered if configured.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.config.delay_for(attempt);
        if self.config.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// Runs `op` until it succeeds, `classify` says the error is not
    /// retryable, attempts run out, or `cancel` fires during a backoff sleep.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, E, C>(
        &self,
        mut op: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> RetryReport<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut failures = Vec::new();
        let mut delays = Vec::new();
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    return RetryReport { result: Ok(value), attempts: attempt, failures, delays, cancelled: false };
                }
                Err(err) => err,
            };

            if !classify(&err) {
                debug!(attempt = attempt, "Error is not retryable");
                return RetryReport { result: Err(err), attempts: attempt, failures, delays, cancelled: false };
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, "Retry attempts exhausted");
                return RetryReport { result: Err(err), attempts: attempt, failures, delays, cancelled: false };
            }

            let delay = self.next_delay(attempt);
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying after delay");
            if !delay.is_zero() {
                tokio::select! {
                    () = self.clock.sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return RetryReport { result: Err(err), attempts: attempt, failures, delays, cancelled: true };
                    }
                }
            } else if cancel.is_cancelled() {
                return RetryReport { result: Err(err), attempts: attempt, failures, delays, cancelled: true };
            }

            delays.push(delay);
            failures.push(err);
            attempt += 1;
        }
    }
}
