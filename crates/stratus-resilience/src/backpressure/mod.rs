//! Backpressure guards.
//!
//! Three independent mechanisms (rate limiting, concurrency bulkheads and
//! priority load shedding) that can be used alone or composed through
//! [`BackpressureLimiter`].

pub mod bulkhead;
pub mod load_shed;
pub mod rate_limit;

use std::sync::Arc;

use stratus_abstraction::Clock;
use tokio_util::sync::CancellationToken;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadRegistry};
pub use load_shed::{LoadShedConfig, LoadShedder, Priority, ShedMode};
pub use rate_limit::{RateLimitConfig, RateLimiter};

use crate::error::ResilienceError;

/// Composition of the three backpressure mechanisms.
///
/// Admission checks run cheapest first: shedding, then the rate limit, then
/// the (possibly waiting) bulkhead.
#[derive(Debug)]
pub struct BackpressureLimiter {
    shedder: Option<LoadShedder>,
    rate_limiter: Option<RateLimiter>,
    bulkheads: BulkheadRegistry,
}

impl BackpressureLimiter {
    /// Creates a limiter with only bulkheads enabled.
    pub fn new(bulkhead: BulkheadConfig) -> Self {
        Self { shedder: None, rate_limiter: None, bulkheads: BulkheadRegistry::new(bulkhead) }
    }

    /// Enables the global rate limiter.
    #[must_use]
    pub fn with_rate_limit(mut self, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        self.rate_limiter = Some(RateLimiter::new(config, clock));
        self
    }

    /// Enables priority load shedding.
    #[must_use]
    pub fn with_load_shedding(mut self, config: LoadShedConfig) -> Self {
        self.shedder = Some(LoadShedder::new(config));
        self
    }

    /// Replaces the bulkhead registry (to add per-compartment overrides).
    #[must_use]
    pub fn with_bulkheads(mut self, bulkheads: BulkheadRegistry) -> Self {
        self.bulkheads = bulkheads;
        self
    }

    /// The bulkhead registry.
    pub fn bulkheads(&self) -> &BulkheadRegistry {
        &self.bulkheads
    }

    /// Admits one operation into `compartment`.
    ///
    /// `load` is the caller's current load fraction; it only matters when
    /// shedding is enabled.
    pub async fn admit(
        &self,
        compartment: &str,
        priority: Priority,
        load: f64,
        cancel: &CancellationToken,
    ) -> Result<BulkheadPermit, ResilienceError> {
        if let Some(shedder) = &self.shedder {
            shedder.check(load, priority)?;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.try_acquire()?;
        }
        self.bulkheads.get(compartment).acquire(cancel).await
    }
}
