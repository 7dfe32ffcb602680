//! Integration tests composing the resilience guards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stratus_abstraction::{ManualClock, PersistentStore, StoreError};
use stratus_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardError, IdempotencyManager,
    ResilienceError, RetryConfig, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MapStore {
    entries: Mutex<BTreeMap<(String, String), Value>>,
}

#[async_trait]
impl PersistentStore for MapStore {
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().unwrap().insert((namespace.into(), key.into()), value);
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Value, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { namespace: namespace.into(), key: key.into() })
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, key)| ns == namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_retry_stops_once_breaker_opens() {
    let clock = ManualClock::default();
    let breaker = CircuitBreaker::new(
        "billing",
        CircuitBreakerConfig { failure_threshold: 3, ..CircuitBreakerConfig::default() },
        Arc::new(clock.clone()),
    );
    let retry = RetryPolicy::new(
        RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            base: 2.0,
            jitter: false,
        },
        Arc::new(clock.clone()),
    );
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let breaker = &breaker;

    let report = retry
        .execute(
            |_| async move {
                breaker
                    .call(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("connection reset")
                    })
                    .await
            },
            |err| matches!(err, GuardError::Failed(_)),
            &CancellationToken::new(),
        )
        .await;

    // Three real calls trip the breaker; the fourth attempt is rejected and not retried.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.attempts, 4);
    assert!(matches!(
        report.result,
        Err(GuardError::Rejected(ResilienceError::CircuitOpen { .. }))
    ));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(
        clock.recorded_sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
    );
}

#[tokio::test]
async fn test_concurrent_same_key_runs_once() {
    let manager = IdempotencyManager::new(Duration::from_secs(60), Arc::new(ManualClock::default()));
    let calls = AtomicU32::new(0);
    let calls = &calls;

    let run = || async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(serde_json::json!({"charged": 42}))
    };

    let (a, b, c) = tokio::join!(
        manager.ensure_once("payment-1", run),
        manager.ensure_once("payment-1", run),
        manager.ensure_once("payment-1", run),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), serde_json::json!({"charged": 42}));
    assert_eq!(b.unwrap(), c.unwrap());
}

#[tokio::test]
async fn test_idempotency_survives_restart_with_store() {
    let clock = ManualClock::default();
    let store: Arc<dyn PersistentStore> = Arc::new(MapStore::default());

    let first = IdempotencyManager::new(Duration::from_secs(60), Arc::new(clock.clone()))
        .with_store(Arc::clone(&store));
    let value: Result<String, GuardError<String>> =
        first.ensure_once("order-7", || async { Ok("shipped".to_string()) }).await;
    assert_eq!(value.unwrap(), "shipped");
    drop(first);

    let second = IdempotencyManager::new(Duration::from_secs(60), Arc::new(clock.clone()))
        .with_store(Arc::clone(&store));
    let replay: Result<String, GuardError<String>> = second
        .ensure_once("order-7", || async { Err("must not run".to_string()) })
        .await;
    assert_eq!(replay.unwrap(), "shipped");

    clock.advance(Duration::from_secs(90));
    assert_eq!(second.purge_expired().await, 1);
    assert!(store.list("idempotency", "").await.unwrap().is_empty());
}
