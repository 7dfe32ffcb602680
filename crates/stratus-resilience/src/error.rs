// Error types for resilience guards

use thiserror::Error;

/// Result type for guard operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Rejections raised by a guard before (or instead of) running an operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    /// The dependency's circuit is open
    #[error("Circuit open for dependency '{dependency}'")]
    CircuitOpen {
        /// Dependency protected by the breaker
        dependency: String,
    },

    /// The rate limiter quota for the current window is spent
    #[error("Rate limited: {limit} operations per {window_ms}ms exceeded")]
    RateLimited {
        /// Operations allowed per window
        limit: usize,
        /// Window length in milliseconds
        window_ms: u64,
    },

    /// The bulkhead's wait queue is full
    #[error("Bulkhead '{compartment}' full ({waiting} callers already waiting)")]
    BulkheadFull {
        /// Compartment name
        compartment: String,
        /// Callers waiting when the request arrived
        waiting: usize,
    },

    /// No bulkhead slot freed up in time
    #[error("Bulkhead '{compartment}' timed out after {waited_ms}ms")]
    BulkheadTimeout {
        /// Compartment name
        compartment: String,
        /// Time spent waiting in milliseconds
        waited_ms: u64,
    },

    /// The load shedder rejected the request
    #[error("Load shed: {priority} request rejected at load {load:.2}")]
    LoadShed {
        /// Priority of the rejected request
        priority: String,
        /// Load fraction at rejection time
        load: f64,
    },

    /// The caller's cancellation token fired while waiting
    #[error("Operation cancelled while waiting for a guard")]
    Cancelled,

    /// A cached result could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ResilienceError {
    /// Returns true for rejections caused by backpressure (rate, bulkhead, shedding).
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::BulkheadFull { .. }
                | Self::BulkheadTimeout { .. }
                | Self::LoadShed { .. }
        )
    }
}

/// Outcome of running an operation through a guard.
///
/// Either the guard rejected the call, or the call itself failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GuardError<E> {
    /// The guard refused to run the operation
    #[error(transparent)]
    Rejected(ResilienceError),

    /// The operation ran and returned an error
    #[error("{0}")]
    Failed(E),
}

impl<E> GuardError<E> {
    /// Maps the wrapped operation error.
    pub fn map_failed<F>(self, f: impl FnOnce(E) -> F) -> GuardError<F> {
        match self {
            Self::Rejected(rejection) => GuardError::Rejected(rejection),
            Self::Failed(err) => GuardError::Failed(f(err)),
        }
    }
}

impl<E> From<ResilienceError> for GuardError<E> {
    fn from(err: ResilienceError) -> Self {
        Self::Rejected(err)
    }
}
