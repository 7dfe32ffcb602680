//! Registry of circuit breakers keyed by dependency name.
//!
//! Breakers protect a dependency, not a caller, so every run that talks to
//! the same dependency shares one breaker. The registry is an ordinary value
//! owned by whoever constructs the engine; tests build isolated registries.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use stratus_abstraction::Clock;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

/// Keyed collection of shared circuit breakers.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
            clock,
        }
    }

    /// Uses `config` instead of the default for `dependency`.
    #[must_use]
    pub fn with_override(mut self, dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// Returns the breaker for `dependency`, creating it on first use.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(dependency)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(dependency.to_string()).or_insert_with(|| {
            let config =
                self.overrides.get(dependency).cloned().unwrap_or_else(|| self.default_config.clone());
            debug!(dependency = %dependency, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(dependency, config, Arc::clone(&self.clock)))
        });
        Arc::clone(breaker)
    }

    /// Returns the breaker for `dependency` only if one already exists.
    pub fn find(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(dependency).cloned()
    }

    /// Resets the breaker for `dependency` to closed. Returns false if unknown.
    pub fn reset(&self, dependency: &str) -> bool {
        self.find(dependency).is_some_and(|breaker| {
            breaker.reset();
            true
        })
    }

    /// Statistics for every breaker, sorted by dependency name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut stats: Vec<CircuitBreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::time::Duration;
    use stratus_abstraction::ManualClock;

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), Arc::new(ManualClock::default()));

        let first = registry.get("search");
        let second = registry.get("search");
        let other = registry.get("billing");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.stats().len(), 2);
    }

    #[test]
    fn test_registry_applies_overrides() {
        let strict = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout: Duration::from_secs(5),
            failure_window: Duration::from_secs(5),
        };
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), Arc::new(ManualClock::default()))
                .with_override("flaky", strict);

        registry.get("flaky").record_failure();
        registry.get("steady").record_failure();

        assert_eq!(registry.get("flaky").state(), CircuitState::Open);
        assert_eq!(registry.get("steady").state(), CircuitState::Closed);
        assert!(registry.reset("flaky"));
        assert_eq!(registry.get("flaky").state(), CircuitState::Closed);
        assert!(!registry.reset("unknown"));
    }
}
