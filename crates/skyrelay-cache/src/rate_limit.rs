//! Fixed- and sliding-window request budgets.
//!
//! Keys look like `<class>:<subject>` (`flights:client-42`); the class picks
//! the rule. Counters live in the shared store so every instance draws from
//! one budget. While the store is unreachable each process counts on its
//! own, which can admit up to N times the budget across N processes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entry::{from_unix_millis, now_millis};
use crate::error::{Error, Result};
use crate::key::{KeySpace, namespaces};
use crate::store::{GuardedStore, SlidingWindowCount};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitAlgorithm {
    /// Counter per `floor(now / window)` bucket
    #[default]
    Fixed,
    /// Timestamps of individual events inside a moving window
    Sliding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            algorithm: RateLimitAlgorithm::default(),
        }
    }
}

impl RateLimitRule {
    pub fn new(max_requests: u64, window_ms: u64, algorithm: RateLimitAlgorithm) -> Self {
        Self {
            max_requests,
            window_ms,
            algorithm,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Rule for classes without their own entry
    #[serde(default)]
    pub default: RateLimitRule,

    /// Rules per endpoint class
    #[serde(default = "default_classes")]
    pub classes: HashMap<String, RateLimitRule>,
}

fn default_classes() -> HashMap<String, RateLimitRule> {
    HashMap::from([
        (
            "airport".to_string(),
            RateLimitRule::new(60, 60_000, RateLimitAlgorithm::Sliding),
        ),
        (
            "flights".to_string(),
            RateLimitRule::new(10, 10_000, RateLimitAlgorithm::Sliding),
        ),
    ])
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: RateLimitRule::default(),
            classes: default_classes(),
        }
    }
}

impl RateLimitConfig {
    pub fn rule_for(&self, key: &str) -> &RateLimitRule {
        let class = key.split(':').next().unwrap_or(key);
        self.classes.get(class).unwrap_or(&self.default)
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub key: String,
    /// Requests counted in the current window, this one included
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    pub allowed: bool,
    /// Zero when allowed, at least one otherwise
    pub retry_after_seconds: u64,
}

pub struct RateLimiter {
    store: Option<GuardedStore>,
    keys: KeySpace,
    config: RateLimitConfig,
    local_fixed: DashMap<String, (u64, u64)>,
    local_sliding: DashMap<String, VecDeque<u64>>,
}

impl RateLimiter {
    pub fn new(store: Option<GuardedStore>, keys: KeySpace, config: RateLimitConfig) -> Self {
        Self {
            store,
            keys,
            config,
            local_fixed: DashMap::new(),
            local_sliding: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request against the rule for the key's class.
    pub async fn check(&self, key: &str) -> RateDecision {
        let rule = self.config.rule_for(key).clone();
        self.check_rule(key, &rule).await
    }

    /// Count a request against an explicit rule.
    pub async fn check_rule(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        let now_ms = now_millis();
        match rule.algorithm {
            RateLimitAlgorithm::Fixed => self.check_fixed(key, rule, now_ms).await,
            RateLimitAlgorithm::Sliding => self.check_sliding(key, rule, now_ms).await,
        }
    }

    /// Like [`check`](Self::check) but turns a rejection into
    /// `Error::RateLimitExceeded`.
    pub async fn enforce(&self, key: &str) -> Result<RateDecision> {
        let decision = self.check(key).await;
        if decision.allowed {
            return Ok(decision);
        }

        let class = key.split(':').next().unwrap_or(key);
        tracing::debug!(
            key = %key,
            count = decision.count,
            limit = decision.limit,
            retry_after_seconds = decision.retry_after_seconds,
            "rate limit exceeded"
        );
        crate::metrics::record_rate_limit_rejection(class);
        Err(Error::RateLimitExceeded {
            key: key.to_string(),
            retry_after_seconds: decision.retry_after_seconds,
        })
    }

    async fn check_fixed(&self, key: &str, rule: &RateLimitRule, now_ms: u64) -> RateDecision {
        let window_ms = rule.window_ms.max(1);
        let bucket = now_ms / window_ms;
        let reset_at_ms = (bucket + 1) * window_ms;
        let bucket_key = self.keys.raw(namespaces::RATE_LIMIT, &format!("{key}:{bucket}"));

        let shared = match self.store.as_ref().filter(|s| s.is_available()) {
            Some(store) => match store.incr_with_expiry(&bucket_key, rule.window()).await {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(
                        key = %bucket_key,
                        error = %e,
                        "shared rate counter unavailable, counting locally"
                    );
                    None
                }
            },
            None => None,
        };
        let count = shared.unwrap_or_else(|| self.local_fixed_incr(key, bucket));

        decision(key, rule, count, now_ms, reset_at_ms)
    }

    /// One slot per key; a new bucket resets the count.
    fn local_fixed_incr(&self, key: &str, bucket: u64) -> u64 {
        let mut slot = self.local_fixed.entry(key.to_string()).or_insert((bucket, 0));
        if slot.0 != bucket {
            *slot = (bucket, 0);
        }
        slot.1 += 1;
        slot.1
    }

    async fn check_sliding(&self, key: &str, rule: &RateLimitRule, now_ms: u64) -> RateDecision {
        let window = rule.window();
        let window_key = self.keys.raw(namespaces::RATE_LIMIT, key);
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

        let shared = match self.store.as_ref().filter(|s| s.is_available()) {
            Some(store) => match store.sliding_window(&window_key, now_ms, &member, window).await {
                Ok(step) => Some(step),
                Err(e) => {
                    tracing::warn!(
                        key = %window_key,
                        error = %e,
                        "shared rate window unavailable, counting locally"
                    );
                    None
                }
            },
            None => None,
        };
        let step = shared.unwrap_or_else(|| self.local_sliding_step(&window_key, now_ms, window));

        let reset_at_ms = step.oldest_ms.unwrap_or(now_ms) + window.as_millis() as u64;
        decision(key, rule, step.count, now_ms, reset_at_ms)
    }

    fn local_sliding_step(
        &self,
        window_key: &str,
        now_ms: u64,
        window: Duration,
    ) -> SlidingWindowCount {
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let mut events = self.local_sliding.entry(window_key.to_string()).or_default();
        while events.front().is_some_and(|at| *at <= cutoff) {
            events.pop_front();
        }
        events.push_back(now_ms);
        SlidingWindowCount {
            count: events.len() as u64,
            oldest_ms: events.front().copied(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("shared", &self.store.is_some())
            .finish()
    }
}

fn decision(
    key: &str,
    rule: &RateLimitRule,
    count: u64,
    now_ms: u64,
    reset_at_ms: u64,
) -> RateDecision {
    let allowed = count <= rule.max_requests;
    let retry_after_seconds = if allowed {
        0
    } else {
        reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    };

    RateDecision {
        key: key.to_string(),
        count,
        limit: rule.max_requests,
        remaining: rule.max_requests.saturating_sub(count),
        reset_at: from_unix_millis(reset_at_ms as i64)
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        allowed,
        retry_after_seconds,
    }
}
