//! Shared (cross-process) key/value store.
//!
//! [`SharedStore`] is the narrow set of operations the resilience layer needs
//! from its primary backend. [`RedisStore`] is the production implementation,
//! [`InMemoryStore`] a process-local one for single-node deployments and
//! tests, and [`GuardedStore`] puts either behind a [`CircuitBreaker`].
//!
//! [`CircuitBreaker`]: crate::breaker::CircuitBreaker

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

mod guarded;
mod memory;
mod redis_store;

pub use guarded::GuardedStore;
pub use memory::InMemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig, RedisTlsMaterial};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of one sliding-window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowCount {
    /// Events in the window, including the one just recorded.
    pub count: u64,
    /// Timestamp (unix ms) of the oldest event still in the window.
    pub oldest_ms: Option<u64>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Delete every key matching a `*` glob. Returns the number deleted.
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64>;

    async fn hincr(&self, key: &str, field: &str, by: i64) -> StoreResult<i64>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Set only if absent. Returns whether the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete only if the current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically increment and (re)set the expiry. Returns the new count.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Atomically drop events older than `now_ms - window`, record `member`
    /// at `now_ms`, count, and refresh the key expiry.
    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window: Duration,
    ) -> StoreResult<SlidingWindowCount>;

    async fn ping(&self) -> StoreResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
