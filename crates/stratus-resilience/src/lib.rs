//! Resilience guards for Stratus.
//!
//! Everything here wraps a caller-supplied async operation and decides
//! whether, when, and how often it actually runs:
//!
//! - [`CircuitBreaker`] stops calling a dependency that keeps failing.
//! - [`RetryPolicy`] re-runs retryable failures with backoff.
//! - [`backpressure`] rate limits, bulkheads and load shedding.
//! - [`IdempotencyManager`] runs an operation at most once per key.
//!
//! All guards read time through [`stratus_abstraction::Clock`].

pub mod backpressure;
pub mod circuit_breaker;
pub mod error;
pub mod idempotency;
pub mod registry;
pub mod retry;

pub use backpressure::{
    BackpressureLimiter, Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadRegistry,
    LoadShedConfig, LoadShedder, Priority, RateLimitConfig, RateLimiter, ShedMode,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use error::{GuardError, ResilienceError, Result};
pub use idempotency::{IDEMPOTENCY_NAMESPACE, IdempotencyManager, IdempotencyRecord};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryConfig, RetryPolicy, RetryReport};
