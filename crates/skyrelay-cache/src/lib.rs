//! Resilience layer in front of rate-limited upstream HTTP APIs.
//!
//! ## Architecture
//!
//! ```text
//! caller ─► TwoLevelCache.get ──hit──► CacheEntry<T>
//!                 │ miss
//!                 ▼
//!     ConcurrencyManager.deduplicate (single-flight + distributed lock)
//!                 │
//!                 ▼
//!     RateLimiter.enforce ─► TokenCache.auth_headers ─► upstream ─► TwoLevelCache.set
//! ```
//!
//! - **Shared tier (Redis)**: behind a [`CircuitBreaker`], shared across instances
//! - **Local tier**: bounded, TTL-based, per-instance, never fails
//!
//! ## Graceful Degradation
//!
//! Shared-store failures are logged and absorbed: reads and writes fall back
//! to the local tier, distributed locks fall back to in-process locks and
//! rate-limit counters fall back to in-process windows.

pub mod breaker;
pub mod concurrency;
pub mod entry;
pub mod error;
pub mod key;
pub mod local;
pub mod metrics;
pub mod rate_limit;
pub mod stats;
pub mod store;
pub mod token;
pub mod two_level;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitSnapshot, CircuitState,
};
pub use concurrency::{
    ConcurrencyManager, Lock, LockConfig, LockFailureMode, LockOptions, LockScope, LockToken,
    RetryConfig, retry_with_backoff,
};
pub use entry::{CacheEntry, CacheSource};
pub use error::{Error, Result, StoreError, UpstreamError};
pub use key::{CacheKey, KeySpace, namespaces};
pub use local::{LocalCacheConfig, LocalCacheStore, LocalStoreStats};
pub use rate_limit::{RateDecision, RateLimitAlgorithm, RateLimitConfig, RateLimitRule, RateLimiter};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{
    GuardedStore, InMemoryStore, RedisStore, RedisStoreConfig, RedisTlsMaterial, SharedStore,
    SlidingWindowCount,
};
pub use token::{BasicCredentials, OAuthCredentials, TokenCache, TokenCacheConfig, TokenRecord};
pub use two_level::TwoLevelCache;
