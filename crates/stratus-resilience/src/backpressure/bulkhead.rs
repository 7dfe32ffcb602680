//! Concurrency bulkheads.
//!
//! Each named compartment owns a bounded pool of slots so that one slow
//! dependency cannot absorb every worker in the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ResilienceError;

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Slots that may be held at once.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; further callers are rejected.
    pub queue_size: usize,
    /// Longest time a caller waits for a slot.
    pub timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, queue_size: 100, timeout: Duration::from_secs(30) }
    }
}

/// A held bulkhead slot. The slot frees when the permit is dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    compartment: String,
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// Compartment the slot belongs to.
    pub fn compartment(&self) -> &str {
        &self.compartment
    }
}

/// Decrements the waiting counter however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of concurrent slots for one compartment.
#[derive(Debug)]
pub struct Bulkhead {
    compartment: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl Bulkhead {
    /// Creates a bulkhead for `compartment`.
    pub fn new(compartment: impl Into<String>, config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { compartment: compartment.into(), config, semaphore, waiting: AtomicUsize::new(0) }
    }

    /// Compartment name.
    pub fn compartment(&self) -> &str {
        &self.compartment
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Acquires a slot, waiting until one frees, the queue is full, the
    /// timeout elapses, or `cancel` fires, whichever comes first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BulkheadPermit, ResilienceError> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.permit(permit));
        }

        let already_waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitingGuard(&self.waiting);
        if already_waiting >= self.config.queue_size {
            warn!(
                compartment = %self.compartment,
                waiting = already_waiting,
                "Bulkhead queue full, rejecting"
            );
            return Err(ResilienceError::BulkheadFull {
                compartment: self.compartment.clone(),
                waiting: already_waiting,
            });
        }

        let started = Instant::now();
        let acquire = tokio::time::timeout(self.config.timeout, Arc::clone(&self.semaphore).acquire_owned());
        tokio::select! {
            outcome = acquire => match outcome {
                Ok(Ok(permit)) => {
                    debug!(
                        compartment = %self.compartment,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Bulkhead slot acquired after waiting"
                    );
                    Ok(self.permit(permit))
                }
                // The semaphore is never closed; treat it like a timeout if it is.
                Ok(Err(_)) | Err(_) => Err(ResilienceError::BulkheadTimeout {
                    compartment: self.compartment.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                }),
            },
            () = cancel.cancelled() => Err(ResilienceError::Cancelled),
        }
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        BulkheadPermit { compartment: self.compartment.clone(), _permit: permit }
    }
}

/// Bulkheads keyed by compartment name.
#[derive(Debug)]
pub struct BulkheadRegistry {
    default_config: BulkheadConfig,
    overrides: HashMap<String, BulkheadConfig>,
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
}

impl BulkheadRegistry {
    /// Creates a registry whose compartments use `default_config`.
    pub fn new(default_config: BulkheadConfig) -> Self {
        Self { default_config, overrides: HashMap::new(), bulkheads: RwLock::new(HashMap::new()) }
    }

    /// Uses `config` instead of the default for `compartment`.
    #[must_use]
    pub fn with_override(mut self, compartment: impl Into<String>, config: BulkheadConfig) -> Self {
        self.overrides.insert(compartment.into(), config);
        self
    }

    /// Returns the bulkhead for `compartment`, creating it on first use.
    pub fn get(&self, compartment: &str) -> Arc<Bulkhead> {
        if let Some(bulkhead) =
            self.bulkheads.read().unwrap_or_else(PoisonError::into_inner).get(compartment)
        {
            return Arc::clone(bulkhead);
        }

        let mut bulkheads = self.bulkheads.write().unwrap_or_else(PoisonError::into_inner);
        let bulkhead = bulkheads.entry(compartment.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(compartment)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            Arc::new(Bulkhead::new(compartment, config))
        });
        Arc::clone(bulkhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrent: usize, queue_size: usize, timeout_ms: u64) -> BulkheadConfig {
        BulkheadConfig { max_concurrent, queue_size, timeout: Duration::from_millis(timeout_ms) }
    }

    #[tokio::test]
    async fn test_acquire_within_capacity() {
        let bulkhead = Bulkhead::new("search", config(2, 0, 10));
        let cancel = CancellationToken::new();

        let first = bulkhead.acquire(&cancel).await.unwrap();
        let _second = bulkhead.acquire(&cancel).await.unwrap();
        assert_eq!(bulkhead.available(), 0);
        assert_eq!(first.compartment(), "search");

        drop(first);
        assert_eq!(bulkhead.available(), 1);
    }

    #[tokio::test]
    async fn test_times_out_when_saturated() {
        let bulkhead = Bulkhead::new("search", config(1, 4, 20));
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        let err = bulkhead.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, ResilienceError::BulkheadTimeout { .. }));
        assert_eq!(bulkhead.waiting(), 0);
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let bulkhead = Bulkhead::new("search", config(1, 0, 1_000));
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        let err = bulkhead.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, ResilienceError::BulkheadFull { waiting: 0, .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_slot_when_released() {
        let bulkhead = Arc::new(Bulkhead::new("search", config(1, 1, 1_000)));
        let cancel = CancellationToken::new();
        let held = bulkhead.acquire(&cancel).await.unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            let cancel = cancel.clone();
            tokio::spawn(async move { bulkhead.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let bulkhead = Bulkhead::new("search", config(1, 1, 10_000));
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let err = bulkhead.acquire(&cancel).await.unwrap_err();
        assert_eq!(err, ResilienceError::Cancelled);
    }

    #[test]
    fn test_registry_isolates_compartments() {
        let registry = BulkheadRegistry::new(config(1, 0, 10)).with_override("wide", config(8, 0, 10));
        assert_eq!(registry.get("narrow").available(), 1);
        assert_eq!(registry.get("wide").available(), 8);
        assert!(Arc::ptr_eq(&registry.get("wide"), &registry.get("wide")));
    }
}
