use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{SharedStore, SlidingWindowCount, StoreResult};
use crate::breaker::{CircuitBreaker, CircuitSnapshot};

/// A [`SharedStore`] behind a [`CircuitBreaker`].
///
/// Cache, locks, rate limiter and token cache all share one `GuardedStore`,
/// so the breaker reflects backend health for every component. While the
/// circuit is open calls fail with `StoreError::CircuitOpen` without touching
/// the backend.
#[derive(Clone)]
pub struct GuardedStore {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedStore {
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// Whether a call made now would reach the backend.
    pub fn is_available(&self) -> bool {
        self.breaker.would_admit()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.breaker.execute(|| self.store.get(key)).await
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.breaker.execute(|| self.store.set_ex(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.breaker.execute(|| self.store.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.breaker.execute(|| self.store.exists(key)).await
    }

    pub async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        self.breaker.execute(|| self.store.delete_matching(pattern)).await
    }

    pub async fn hincr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        self.breaker.execute(|| self.store.hincr(key, field, by)).await
    }

    pub async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.breaker.execute(|| self.store.hgetall(key)).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.breaker.execute(|| self.store.hset(key, field, value)).await
    }

    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.breaker.execute(|| self.store.set_nx_ex(key, value, ttl)).await
    }

    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.breaker
            .execute(|| self.store.compare_and_delete(key, expected))
            .await
    }

    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.breaker
            .execute(|| self.store.incr_with_expiry(key, ttl))
            .await
    }

    pub async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window: Duration,
    ) -> StoreResult<SlidingWindowCount> {
        self.breaker
            .execute(|| self.store.sliding_window(key, now_ms, member, window))
            .await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.breaker.execute(|| self.store.ping()).await
    }
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("backend", &self.store.backend_name())
            .field("breaker", &self.breaker)
            .finish()
    }
}
