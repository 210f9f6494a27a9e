use std::time::Duration;

use skyrelay_cache::{CacheEntry, CacheKey, Result, UpstreamError, namespaces};

use super::{endpoint, send_json};
use crate::fetcher::{CachedFetcher, endpoints};
use crate::models::Airport;

/// Upper-case and check a 3-letter IATA or 4-letter ICAO code.
pub fn normalize_airport_code(code: &str) -> std::result::Result<String, UpstreamError> {
    let code = code.trim().to_ascii_uppercase();
    let valid = matches!(code.len(), 3 | 4) && code.chars().all(|c| c.is_ascii_alphabetic());
    if valid {
        Ok(code)
    } else {
        Err(UpstreamError::InvalidRequest(format!(
            "'{code}' is not a 3-letter IATA or 4-letter ICAO airport code"
        )))
    }
}

/// Client for the airport-metadata API.
#[derive(Clone)]
pub struct AirportClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AirportClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// `GET {base}/airport/{code}`
    pub async fn lookup(&self, code: &str) -> std::result::Result<Airport, UpstreamError> {
        let code = normalize_airport_code(code)?;
        let url = endpoint(&self.base_url, &format!("airport/{}", urlencoding::encode(&code)));

        let mut request = self.http.get(url);
        if !self.api_key.is_empty() {
            request = request.query(&[("apiToken", self.api_key.as_str())]);
        }

        send_json(request, "airport", &format!("airport {code}")).await
    }
}

impl std::fmt::Debug for AirportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirportClient")
            .field("base_url", &self.base_url)
            .field("api_key", &(!self.api_key.is_empty()).then_some("[REDACTED]"))
            .finish()
    }
}

/// Cached airport lookups.
#[derive(Debug, Clone)]
pub struct AirportService {
    client: AirportClient,
    fetcher: CachedFetcher,
    ttl: Duration,
}

impl AirportService {
    pub fn new(client: AirportClient, fetcher: CachedFetcher, ttl: Duration) -> Self {
        Self { client, fetcher, ttl }
    }

    pub async fn lookup(&self, code: &str) -> Result<CacheEntry<Airport>> {
        let code = normalize_airport_code(code)?;
        let key = CacheKey::new(namespaces::AIRPORT, &code);

        let client = self.client.clone();
        self.fetcher
            .fetch(&key, self.ttl, endpoints::AIRPORT, move |_headers| {
                let client = client.clone();
                let code = code.clone();
                async move { client.lookup(&code).await }
            })
            .await
    }
}
