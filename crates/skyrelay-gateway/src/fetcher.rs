//! Read-through fetching: cache, single-flight, budget, credentials, upstream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use skyrelay_cache::{
    CacheEntry, CacheKey, ConcurrencyManager, Error, RateLimiter, Result, TokenCache,
    TwoLevelCache, UpstreamError,
};

/// How an upstream endpoint is budgeted and authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Rate-limit class
    pub class: &'static str,
    /// Send credentials from the token cache
    pub authenticated: bool,
}

pub mod endpoints {
    use super::Endpoint;

    pub const AIRPORT: Endpoint = Endpoint {
        class: "airport",
        authenticated: false,
    };

    pub const FLIGHTS: Endpoint = Endpoint {
        class: "flights",
        authenticated: true,
    };
}

/// Cheap to clone.
#[derive(Clone)]
pub struct CachedFetcher {
    cache: TwoLevelCache,
    concurrency: ConcurrencyManager,
    rate_limiter: Arc<RateLimiter>,
    tokens: TokenCache,
    /// Second segment of every budget key
    subject: Arc<str>,
}

impl CachedFetcher {
    pub fn new(
        cache: TwoLevelCache,
        concurrency: ConcurrencyManager,
        rate_limiter: Arc<RateLimiter>,
        tokens: TokenCache,
        subject: &str,
    ) -> Self {
        Self {
            cache,
            concurrency,
            rate_limiter,
            tokens,
            subject: Arc::from(subject),
        }
    }

    pub fn cache(&self) -> &TwoLevelCache {
        &self.cache
    }

    fn budget_key(&self, endpoint: Endpoint) -> String {
        format!("{}:{}", endpoint.class, self.subject)
    }

    /// Serve `key` from cache, or load it once through `fetch_fn`.
    ///
    /// Concurrent callers for the same key share one load. Inside the load
    /// the cache is checked again, the endpoint budget is charged, and the
    /// upstream call is retried on transport errors and 5xx. Errors,
    /// including 404s, are never cached.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        endpoint: Endpoint,
        fetch_fn: F,
    ) -> Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(HeaderMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, UpstreamError>> + Send + 'static,
    {
        if let Some(hit) = self.cache.get::<T>(key).await {
            return Ok(hit);
        }

        let fetcher = self.clone();
        let owned_key = key.clone();
        self.concurrency
            .deduplicate(&key.to_string(), move || async move {
                fetcher.load(&owned_key, ttl, endpoint, fetch_fn).await
            })
            .await
    }

    async fn load<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        endpoint: Endpoint,
        fetch_fn: F,
    ) -> Result<CacheEntry<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(HeaderMap) -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        // Someone may have filled it while we waited for the lock.
        if let Some(hit) = self.cache.get::<T>(key).await {
            return Ok(hit);
        }

        self.rate_limiter.enforce(&self.budget_key(endpoint)).await?;

        let headers = if endpoint.authenticated {
            self.tokens.auth_headers().await?
        } else {
            HeaderMap::new()
        };

        let data = self
            .concurrency
            .with_retry(|| {
                let pending = fetch_fn(headers.clone());
                async move { pending.await.map_err(Error::from) }
            })
            .await?;

        let written = self.cache.set(key, &data, ttl).await?;
        tracing::debug!(key = %key, source = %written.source, "fetched from upstream");
        Ok(written.map(|_| data))
    }
}

impl std::fmt::Debug for CachedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFetcher")
            .field("mode", &self.cache.mode())
            .field("subject", &self.subject)
            .finish()
    }
}
