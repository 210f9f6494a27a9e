//! HTTP clients for the upstream APIs and the services that put them behind
//! the cache.

mod airport;
mod flights;

pub use airport::{AirportClient, AirportService, normalize_airport_code};
pub use flights::{BoundingBox, FlightClient, FlightService, StatesQuery, normalize_icao24};

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use skyrelay_cache::UpstreamError;

/// Build the HTTP client shared by the upstream clients.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("skyrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| UpstreamError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Send a request and decode a JSON body, classifying failures.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    api: &'static str,
    resource: &str,
) -> Result<T, UpstreamError> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            skyrelay_cache::metrics::record_upstream_request(api, "transport_error");
            tracing::warn!(api, resource, error = %e, "upstream request failed");
            return Err(UpstreamError::Transport(e.to_string()));
        }
    };

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let error = UpstreamError::from_status(status.as_u16(), resource, retry_after);
        skyrelay_cache::metrics::record_upstream_request(api, outcome(&error));
        tracing::debug!(api, resource, status = status.as_u16(), "upstream returned an error");
        return Err(error);
    }

    skyrelay_cache::metrics::record_upstream_request(api, "success");
    response
        .json::<T>()
        .await
        .map_err(|e| UpstreamError::Decode(e.to_string()))
}

fn outcome(error: &UpstreamError) -> &'static str {
    match error {
        UpstreamError::NotFound { .. } => "not_found",
        UpstreamError::AuthRequired { .. } => "auth_required",
        UpstreamError::RateLimited { .. } => "rate_limited",
        UpstreamError::InvalidRequest(_) => "invalid_request",
        UpstreamError::Server { .. } => "server_error",
        UpstreamError::Transport(_) => "transport_error",
        UpstreamError::Decode(_) => "decode_error",
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            endpoint("https://api.example.com/", "/states/all"),
            "https://api.example.com/states/all"
        );
        assert_eq!(
            endpoint("https://api.example.com/v1", "airport/KJFK"),
            "https://api.example.com/v1/airport/KJFK"
        );
    }
}
