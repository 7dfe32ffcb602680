//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_abstraction::Clock;

use crate::error::ResilienceError;

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum operations per window
    pub max_operations: usize,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_operations: 60, window: Duration::from_secs(60) }
    }
}

/// Fixed quota of operations per sliding window.
///
/// Requests beyond the quota are rejected, never queued.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    admitted: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, admitted: Mutex::new(VecDeque::new()) }
    }

    /// Try to admit one operation
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        Self::evict(&mut admitted, now, self.config.window);

        if admitted.len() >= self.config.max_operations {
            return Err(ResilienceError::RateLimited {
                limit: self.config.max_operations,
                window_ms: self.config.window.as_millis() as u64,
            });
        }

        admitted.push_back(now);
        Ok(())
    }

    /// Operations still available in the current window
    pub fn remaining(&self) -> usize {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        Self::evict(&mut admitted, now, self.config.window);
        self.config.max_operations.saturating_sub(admitted.len())
    }

    fn evict(admitted: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
        while let Some(&oldest) = admitted.front() {
            let age = (now - oldest).to_std().unwrap_or(Duration::ZERO);
            if age >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_abstraction::ManualClock;

    #[test]
    fn test_rejects_beyond_quota_and_recovers() {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(
            RateLimitConfig { max_operations: 2, window: Duration::from_secs(10) },
            Arc::new(clock.clone()),
        );

        assert!(limiter.try_acquire().is_ok());
        clock.advance(Duration::from_secs(4));
        assert!(limiter.try_acquire().is_ok());
        assert!(matches!(limiter.try_acquire(), Err(ResilienceError::RateLimited { limit: 2, .. })));

        // The first admission slides out of the window.
        clock.advance(Duration::from_secs(6));
        assert_eq!(limiter.remaining(), 1);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }
}
