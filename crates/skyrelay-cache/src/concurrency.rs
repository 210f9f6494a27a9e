//! Distributed locks, in-process single-flight and retry with backoff.
//!
//! ## Locks
//!
//! A lock is a `SET NX PX` of a fresh random token under
//! `<prefix>:lock:<key>`. Release is a compare-and-delete on that token, so a
//! holder whose lock expired and was re-acquired elsewhere can never delete
//! the new holder's lock. When the shared store is unreachable, locks fall
//! back to an in-process table; that only serializes callers within this
//! process.
//!
//! ## Single-flight
//!
//! Concurrent [`ConcurrencyManager::deduplicate`] calls for the same key share
//! one execution. The leader runs on a spawned task, so callers that stop
//! waiting do not cancel the fetch: it still populates the cache and releases
//! its lock.

use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::key::{KeySpace, namespaces};
use crate::store::GuardedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockFailureMode {
    /// Proceed without exclusivity, logging a warning.
    #[default]
    Open,
    /// Reject with `LockAcquisitionFailed`.
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    /// Extra attempts after the first on contention
    #[serde(default = "default_lock_retries")]
    pub retries: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub failure_mode: LockFailureMode,
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_lock_retries() -> u32 {
    10
}

fn default_lock_retry_delay_ms() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            retries: default_lock_retries(),
            retry_delay_ms: default_lock_retry_delay_ms(),
            failure_mode: LockFailureMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): exponential, ±25%
    /// jitter, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self.base_delay_ms.saturating_mul(1u64 << exponent) as f64;
        let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = (base * jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Per-call lock parameters.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub failure_mode: LockFailureMode,
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs.max(1)),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            failure_mode: config.failure_mode,
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// Opaque proof of lock ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Rebuild a token handed out earlier.
    pub fn from_raw(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Distributed,
    /// In-process fallback; excludes nobody outside this process.
    Local,
}

#[derive(Debug, Clone)]
pub struct Lock {
    pub key: String,
    pub token: LockToken,
    pub ttl: Duration,
    pub acquired: bool,
    pub scope: LockScope,
}

#[derive(Debug)]
struct LocalLock {
    token: LockToken,
    expires_at: Instant,
}

type FlightOutcome = Option<std::result::Result<Arc<dyn Any + Send + Sync>, Error>>;

struct Inner {
    store: Option<GuardedStore>,
    keys: KeySpace,
    locks: LockConfig,
    retry: RetryConfig,
    local_locks: DashMap<String, LocalLock>,
    in_flight: DashMap<(TypeId, String), watch::Receiver<FlightOutcome>>,
}

/// Locks, single-flight and retries. Cheap to clone.
#[derive(Clone)]
pub struct ConcurrencyManager {
    inner: Arc<Inner>,
}

impl ConcurrencyManager {
    pub fn new(
        store: Option<GuardedStore>,
        keys: KeySpace,
        locks: LockConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                keys,
                locks,
                retry,
                local_locks: DashMap::new(),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::from(&self.inner.locks)
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    /// Operations currently executing under single-flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Try to take `key`, retrying with a fixed delay on contention.
    ///
    /// Never errors: a lock that could not be taken comes back with
    /// `acquired == false`.
    pub async fn acquire_lock(&self, key: &str, options: &LockOptions) -> Lock {
        let lock_key = self.inner.keys.raw(namespaces::LOCK, key);
        let token = LockToken::generate();

        for attempt in 0..=options.retries {
            let (acquired, scope) = self.try_acquire(&lock_key, &token, options.ttl).await;
            if acquired {
                tracing::debug!(key = %lock_key, attempt, scope = ?scope, "lock acquired");
                return Lock {
                    key: key.to_string(),
                    token,
                    ttl: options.ttl,
                    acquired: true,
                    scope,
                };
            }
            if attempt < options.retries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        tracing::debug!(key = %lock_key, retries = options.retries, "lock contended");
        Lock {
            key: key.to_string(),
            token,
            ttl: options.ttl,
            acquired: false,
            scope: LockScope::Distributed,
        }
    }

    async fn try_acquire(
        &self,
        lock_key: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> (bool, LockScope) {
        if let Some(store) = self.inner.store.as_ref().filter(|s| s.is_available()) {
            match store.set_nx_ex(lock_key, token.as_str(), ttl).await {
                Ok(acquired) => return (acquired, LockScope::Distributed),
                Err(e) => {
                    tracing::warn!(
                        key = %lock_key,
                        error = %e,
                        "distributed lock unavailable, using local lock"
                    );
                    crate::metrics::record_lock_fallback();
                }
            }
        }
        (self.try_acquire_local(lock_key, token, ttl), LockScope::Local)
    }

    fn try_acquire_local(&self, lock_key: &str, token: &LockToken, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.inner.local_locks.entry(lock_key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return false;
                }
                held.insert(LocalLock {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(LocalLock {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
                true
            }
        }
    }

    /// Release `key` if `token` still owns it. Returns `false` when the token
    /// does not match or the lock is gone.
    pub async fn release_lock(&self, key: &str, token: &LockToken) -> bool {
        let lock_key = self.inner.keys.raw(namespaces::LOCK, key);

        if self
            .inner
            .local_locks
            .remove_if(&lock_key, |_, held| held.token == *token)
            .is_some()
        {
            return true;
        }

        let Some(store) = self.inner.store.as_ref() else {
            return false;
        };
        match store.compare_and_delete(&lock_key, token.as_str()).await {
            Ok(released) => {
                if !released {
                    tracing::debug!(
                        key = %lock_key,
                        "lock not released: token mismatch or expired"
                    );
                }
                released
            }
            Err(e) => {
                tracing::warn!(
                    key = %lock_key,
                    error = %e,
                    "failed to release lock; it will expire"
                );
                false
            }
        }
    }

    /// Run `f` while holding `key`, releasing afterwards whatever the outcome.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, options: &LockOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.acquire_lock(key, options).await;

        if !lock.acquired {
            match options.failure_mode {
                LockFailureMode::Closed => {
                    return Err(Error::LockAcquisitionFailed {
                        key: key.to_string(),
                    });
                }
                LockFailureMode::Open => {
                    tracing::warn!(key = %key, "lock not acquired, proceeding without exclusivity");
                }
            }
        }

        let mut guard = ReleaseOnDrop {
            manager: self.clone(),
            lock: lock.acquired.then_some(lock),
        };
        let result = f().await;
        if let Some(lock) = guard.lock.take() {
            self.release_lock(&lock.key, &lock.token).await;
        }
        result
    }

    /// Single-flight `f` under `key` with the configured lock options.
    pub async fn deduplicate<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.deduplicate_with(key, &self.lock_options(), f).await
    }

    /// Share one execution of `f` among all concurrent callers for `key`.
    ///
    /// Every caller gets a clone of the same value, or the same error. The
    /// registry entry is dropped as soon as the execution settles.
    pub async fn deduplicate_with<T, F, Fut>(
        &self,
        key: &str,
        options: &LockOptions,
        f: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let flight_key = (TypeId::of::<T>(), key.to_string());

        let receiver = match self.inner.in_flight.entry(flight_key.clone()) {
            Entry::Occupied(flight) => {
                tracing::debug!(key = %key, "joining in-flight operation");
                crate::metrics::record_single_flight_join();
                flight.get().clone()
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(None);
                slot.insert(receiver.clone());

                let flight = Flight {
                    manager: self.clone(),
                    key: flight_key,
                    sender,
                    settled: false,
                };
                let manager = self.clone();
                let key = key.to_string();
                let options = options.clone();
                tokio::spawn(async move {
                    let result = manager.with_lock(&key, &options, f).await;
                    flight.settle(
                        result.map(|value| Arc::new(value) as Arc<dyn Any + Send + Sync>),
                    );
                });

                receiver
            }
        };

        Self::wait_for_flight(receiver).await
    }

    async fn wait_for_flight<T: Clone + 'static>(
        mut receiver: watch::Receiver<FlightOutcome>,
    ) -> Result<T> {
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal("in-flight operation aborted".into()))?;

        match outcome.as_ref() {
            Some(Ok(value)) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| Error::Internal("in-flight result has unexpected type".into())),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::Internal("in-flight operation produced no result".into())),
        }
    }

    /// Retry retryable errors with the configured backoff.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.inner.retry, op, Error::is_retryable).await
    }
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("locks", &self.inner.locks)
            .field("retry", &self.inner.retry)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

/// Leader side of a single-flight registration.
///
/// Dropped unsettled when the leader panics: the registry entry is removed
/// before the sender closes, so followers see an error and the next caller
/// starts a fresh flight.
struct Flight {
    manager: ConcurrencyManager,
    key: (TypeId, String),
    sender: watch::Sender<FlightOutcome>,
    settled: bool,
}

impl Flight {
    fn settle(mut self, outcome: Result<Arc<dyn Any + Send + Sync>>) {
        self.manager.inner.in_flight.remove(&self.key);
        self.settled = true;
        let _ = self.sender.send(Some(outcome));
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if !self.settled {
            self.manager.inner.in_flight.remove(&self.key);
        }
    }
}

/// Releases a still-held lock when `with_lock` is cancelled mid-flight.
struct ReleaseOnDrop {
    manager: ConcurrencyManager,
    lock: Option<Lock>,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            handle.spawn(async move {
                manager.release_lock(&lock.key, &lock.token).await;
            });
        }
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts for which `should_retry` holds. Returns the last
/// error.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryConfig,
    mut op: F,
    should_retry: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
