//! At-most-once execution per idempotency key.
//!
//! The first successful completion for a key is cached until its TTL
//! expires. Concurrent callers with the same key are coalesced: later
//! callers wait on a per-key lock and then read the first caller's result
//! instead of running the operation again. Failures are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_abstraction::{Clock, PersistentStore};
use tracing::{debug, warn};

use crate::error::{GuardError, ResilienceError};

/// Store namespace for persisted idempotency records.
pub const IDEMPOTENCY_NAMESPACE: &str = "idempotency";

/// Cached result of an operation, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Idempotency key.
    pub key: String,
    /// Result of the first successful execution.
    pub result: Value,
    /// When the result was recorded.
    pub created_at: DateTime<Utc>,
    /// When the record stops being honoured.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Returns true once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Idempotency manager with optional persistent backing.
pub struct IdempotencyManager {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn PersistentStore>>,
    records: RwLock<HashMap<String, IdempotencyRecord>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for IdempotencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyManager")
            .field("ttl", &self.ttl)
            .field("persistent", &self.store.is_some())
            .field("records", &self.records.read().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl IdempotencyManager {
    /// Creates an in-memory manager whose records live for `ttl`.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            store: None,
            records: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirrors records to `store` so they survive a restart.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Record lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs `op` at most once per `key` within the TTL window.
    ///
    /// Returns the cached result when a live record exists.
    pub async fn ensure_once<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, GuardError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(record) = self.lookup(key).await {
            return Self::decode(key, record.result).map_err(GuardError::Rejected);
        }

        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(record) = self.lookup(key).await {
            debug!(key = %key, "Coalesced with in-flight execution");
            return Self::decode(key, record.result).map_err(GuardError::Rejected);
        }

        let value = op().await.map_err(GuardError::Failed)?;
        let encoded = serde_json::to_value(&value)
            .map_err(|e| GuardError::Rejected(ResilienceError::Serialization(e.to_string())))?;
        self.remember(key, encoded).await;
        Ok(value)
    }

    /// Returns the live record for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.lookup(key).await
    }

    /// Drops every expired record from memory and the backing store.
    ///
    /// Returns the number of records removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<String> =
                records.values().filter(|r| r.is_expired(now)).map(|r| r.key.clone()).collect();
            for key in &expired {
                records.remove(key);
            }
            expired
        };

        let mut removed = expired.len();
        if let Some(store) = &self.store {
            for key in &expired {
                Self::delete_persisted(store.as_ref(), key).await;
            }
            match store.list(IDEMPOTENCY_NAMESPACE, "").await {
                Ok(keys) => {
                    for key in keys.iter().filter(|k| !expired.contains(k)) {
                        if let Some(record) = Self::load_persisted(store.as_ref(), key).await {
                            if record.is_expired(now) {
                                Self::delete_persisted(store.as_ref(), key).await;
                                removed += 1;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list persisted idempotency records"),
            }
        }

        // Forget locks nobody holds or waits on.
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if removed > 0 {
            debug!(removed = removed, "Purged expired idempotency records");
        }
        removed
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    async fn lookup(&self, key: &str) -> Option<IdempotencyRecord> {
        let now = self.clock.now();

        let cached = self.records.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned();
        if let Some(record) = cached {
            if !record.is_expired(now) {
                return Some(record);
            }
            self.records.write().unwrap_or_else(PoisonError::into_inner).remove(key);
            if let Some(store) = &self.store {
                Self::delete_persisted(store.as_ref(), key).await;
            }
            return None;
        }

        let store = self.store.as_ref()?;
        let record = Self::load_persisted(store.as_ref(), key).await?;
        if record.is_expired(now) {
            Self::delete_persisted(store.as_ref(), key).await;
            return None;
        }
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record.clone());
        Some(record)
    }

    async fn remember(&self, key: &str, result: Value) {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = IdempotencyRecord { key: key.to_string(), result, created_at: now, expires_at };

        if let Some(store) = &self.store {
            match serde_json::to_value(&record) {
                Ok(encoded) => {
                    if let Err(e) = store.save(IDEMPOTENCY_NAMESPACE, key, encoded).await {
                        warn!(key = %key, error = %e, "Failed to persist idempotency record");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to encode idempotency record"),
            }
        }

        self.records.write().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), record);
    }

    async fn load_persisted(store: &dyn PersistentStore, key: &str) -> Option<IdempotencyRecord> {
        match store.load(IDEMPOTENCY_NAMESPACE, key).await {
            Ok(value) => match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable idempotency record");
                    None
                }
            },
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to load idempotency record");
                None
            }
        }
    }

    async fn delete_persisted(store: &dyn PersistentStore, key: &str) {
        if let Err(e) = store.delete(IDEMPOTENCY_NAMESPACE, key).await {
            warn!(key = %key, error = %e, "Failed to delete idempotency record");
        }
    }

    fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ResilienceError> {
        serde_json::from_value(value).map_err(|e| {
            ResilienceError::Serialization(format!("cached result for '{}': {}", key, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stratus_abstraction::ManualClock;

    fn manager(clock: &ManualClock) -> IdempotencyManager {
        IdempotencyManager::new(Duration::from_secs(60), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_second_call_returns_cached_result() {
        let clock = ManualClock::default();
        let manager = manager(&clock);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value: Result<u32, GuardError<String>> = manager
                .ensure_once("charge-42", || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) + 100)
                })
                .await;
            assert_eq!(value, Ok(100));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let clock = ManualClock::default();
        let manager = manager(&clock);

        let first: Result<u32, GuardError<&str>> =
            manager.ensure_once("k", || async { Err("timeout") }).await;
        assert_eq!(first, Err(GuardError::Failed("timeout")));

        let second: Result<u32, GuardError<&str>> = manager.ensure_once("k", || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn test_record_expires_after_ttl() {
        let clock = ManualClock::default();
        let manager = manager(&clock);

        let _: Result<u32, GuardError<()>> = manager.ensure_once("k", || async { Ok(1) }).await;
        clock.advance(Duration::from_secs(61));

        let again: Result<u32, GuardError<()>> = manager.ensure_once("k", || async { Ok(2) }).await;
        assert_eq!(again, Ok(2));
    }

    #[tokio::test]
    async fn test_oversized_ttl_never_expires() {
        let clock = ManualClock::default();
        let manager = IdempotencyManager::new(Duration::MAX, Arc::new(clock.clone()));

        let _: Result<u32, GuardError<()>> = manager.ensure_once("k", || async { Ok(1) }).await;
        let record = manager.get("k").await.unwrap();
        assert_eq!(record.expires_at, DateTime::<Utc>::MAX_UTC);

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        let again: Result<u32, GuardError<()>> = manager.ensure_once("k", || async { Ok(2) }).await;
        assert_eq!(again, Ok(1));
        assert_eq!(manager.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_purge_expired_removes_records() {
        let clock = ManualClock::default();
        let manager = manager(&clock);

        let _: Result<u32, GuardError<()>> = manager.ensure_once("a", || async { Ok(1) }).await;
        let _: Result<u32, GuardError<()>> = manager.ensure_once("b", || async { Ok(2) }).await;
        clock.advance(Duration::from_secs(120));

        assert_eq!(manager.purge_expired().await, 2);
        assert!(manager.get("a").await.is_none());
    }
}
