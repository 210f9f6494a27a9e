//! Per-namespace hit/miss/error counters.
//!
//! Counters live in the shared hash `<prefix>:stats:<namespace>` (HINCRBY,
//! fire-and-forget) and are mirrored locally so stats survive an outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;

use crate::entry::{CacheSource, from_unix_millis, unix_millis};
use crate::key::{KeySpace, namespaces};
use crate::store::GuardedStore;

const HITS: &str = "hits";
const MISSES: &str = "misses";
const ERRORS: &str = "errors";
const LAST_RESET: &str = "last_reset";

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub namespace: String,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_reset: OffsetDateTime,
    pub source: CacheSource,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    last_reset_ms: AtomicI64,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_reset_ms: AtomicI64::new(unix_millis(OffsetDateTime::now_utc())),
        }
    }
}

#[derive(Clone)]
pub struct CacheStats {
    shared: Option<GuardedStore>,
    keys: KeySpace,
    local: Arc<DashMap<String, Counters>>,
}

impl CacheStats {
    pub fn new(shared: Option<GuardedStore>, keys: KeySpace) -> Self {
        Self {
            shared,
            keys,
            local: Arc::new(DashMap::new()),
        }
    }

    pub fn record_hit(&self, namespace: &str) {
        self.bump(namespace, HITS);
    }

    pub fn record_miss(&self, namespace: &str) {
        self.bump(namespace, MISSES);
    }

    pub fn record_error(&self, namespace: &str) {
        self.bump_local(namespace, ERRORS);
        self.push(namespace, ERRORS);
    }

    fn bump(&self, namespace: &str, field: &'static str) {
        self.bump_local(namespace, field);
        self.push(namespace, field);
    }

    fn bump_local(&self, namespace: &str, field: &'static str) {
        let counters = self
            .local
            .entry(namespace.to_string())
            .or_insert_with(Counters::new);
        let counter = match field {
            HITS => &counters.hits,
            MISSES => &counters.misses,
            _ => &counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fire-and-forget HINCRBY. A failure counts as a local error.
    fn push(&self, namespace: &str, field: &'static str) {
        let Some(shared) = self.shared.clone().filter(|s| s.is_available()) else {
            return;
        };
        let key = self.keys.raw(namespaces::STATS, namespace);
        let local = Arc::clone(&self.local);
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            if let Err(e) = shared.hincr(&key, field, 1).await {
                tracing::debug!(key = %key, error = %e, "stats increment failed");
                if let Some(counters) = local.get(&namespace) {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    /// Shared counters when reachable, local mirror otherwise.
    pub async fn snapshot(&self, namespace: &str) -> StatsSnapshot {
        if let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) {
            let key = self.keys.raw(namespaces::STATS, namespace);
            match shared.hgetall(&key).await {
                Ok(fields) if !fields.is_empty() => {
                    let field = |name: &str| {
                        fields
                            .get(name)
                            .and_then(|v| v.parse::<i64>().ok())
                            .unwrap_or(0)
                    };
                    let last_reset = fields
                        .get(LAST_RESET)
                        .and_then(|v| v.parse::<i64>().ok())
                        .and_then(|ms| from_unix_millis(ms).ok())
                        .unwrap_or_else(|| self.local_snapshot(namespace).last_reset);

                    return StatsSnapshot {
                        namespace: namespace.to_string(),
                        hits: field(HITS).max(0) as u64,
                        misses: field(MISSES).max(0) as u64,
                        errors: field(ERRORS).max(0) as u64,
                        last_reset,
                        source: CacheSource::Shared,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(namespace = %namespace, error = %e, "shared stats unavailable");
                }
            }
        }

        self.local_snapshot(namespace)
    }

    pub fn local_snapshot(&self, namespace: &str) -> StatsSnapshot {
        let (hits, misses, errors, last_reset_ms) = match self.local.get(namespace) {
            Some(c) => (
                c.hits.load(Ordering::Relaxed),
                c.misses.load(Ordering::Relaxed),
                c.errors.load(Ordering::Relaxed),
                c.last_reset_ms.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0, unix_millis(OffsetDateTime::now_utc())),
        };

        StatsSnapshot {
            namespace: namespace.to_string(),
            hits,
            misses,
            errors,
            last_reset: from_unix_millis(last_reset_ms)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            source: CacheSource::Local,
        }
    }

    /// Zero the counters in both tiers and stamp `last_reset`.
    pub async fn reset(&self, namespace: &str) {
        let now_ms = unix_millis(OffsetDateTime::now_utc());
        {
            let counters = self
                .local
                .entry(namespace.to_string())
                .or_insert_with(Counters::new);
            counters.hits.store(0, Ordering::Relaxed);
            counters.misses.store(0, Ordering::Relaxed);
            counters.errors.store(0, Ordering::Relaxed);
            counters.last_reset_ms.store(now_ms, Ordering::Relaxed);
        }

        if let Some(shared) = self.shared.as_ref().filter(|s| s.is_available()) {
            let key = self.keys.raw(namespaces::STATS, namespace);
            let result = async {
                shared.delete(&key).await?;
                shared.hset(&key, LAST_RESET, &now_ms.to_string()).await
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(namespace = %namespace, error = %e, "failed to reset shared stats");
            }
        }
    }
}
