//! Upstream APIs behind the full fetch pipeline, against wiremock servers.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use skyrelay_cache::{CacheSource, Error, RateLimitAlgorithm, RateLimitRule, UpstreamError};
use skyrelay_config::SecretsProvider;
use skyrelay_gateway::upstream::StatesQuery;
use skyrelay_gateway::{AppConfig, Services};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn services(server: &MockServer, tweak: impl FnOnce(&mut AppConfig)) -> Services {
    let mut cfg = AppConfig::default();
    cfg.upstream.airport_base_url = server.uri();
    cfg.upstream.flight_base_url = server.uri();
    cfg.upstream.airport_api_key = "test-key".into();
    cfg.upstream.timeout_ms = 2_000;
    cfg.retry.base_delay_ms = 10;
    cfg.retry.max_delay_ms = 50;
    tweak(&mut cfg);

    Services::initialize(&cfg, SecretsProvider::env("SKYRELAY_UPSTREAM_TEST_"))
        .await
        .expect("services")
}

fn states_body() -> serde_json::Value {
    json!({
        "time": 1_700_000_000,
        "states": [[
            "3c6444", "DLH9LF  ", "Germany", 1_700_000_000, 1_700_000_001,
            6.1, 50.2, 9_144.0, false, 231.3, 98.2, -0.3, null, 9_300.0, "1000", false, 0
        ]]
    })
}

#[tokio::test]
async fn airport_lookup_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/airport/KJFK"))
        .and(query_param("apiToken", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ident": "KJFK",
            "name": "John F Kennedy International Airport",
            "type": "large_airport",
            "iata_code": "JFK",
            "icao_code": "KJFK",
            "latitude_deg": 40.639447,
            "longitude_deg": -73.779317
        })))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, |_| {}).await;

    let first = services.airports.lookup("kjfk").await.expect("lookup");
    assert_eq!(first.data.iata_code.as_deref(), Some("JFK"));
    assert_eq!(first.source, CacheSource::Local);

    let second = services.airports.lookup("KJFK").await.expect("cached lookup");
    assert_eq!(second.data, first.data);

    let err = services.clear(Some("lock:*")).await.expect_err("internal namespace");
    assert_eq!(err.status_code(), 400);
    assert_eq!(services.clear(None).await.expect("clear"), 1);

    services.shutdown().await;
}

#[tokio::test]
async fn not_found_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/airport/ZZZZ"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let services = services(&server, |_| {}).await;

    for _ in 0..2 {
        let err = services.airports.lookup("ZZZZ").await.expect_err("not found");
        assert!(matches!(err, Error::Upstream(UpstreamError::NotFound { .. })));
        assert_eq!(err.status_code(), 404);
    }
}

#[tokio::test]
async fn invalid_codes_never_reach_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let services = services(&server, |_| {}).await;

    let err = services.airports.lookup("K*").await.expect_err("invalid code");
    assert_eq!(err.status_code(), 400);

    let err = services
        .flights
        .arrivals("EDDF", 0, 30 * 24 * 3600)
        .await
        .expect_err("interval too long");
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn concurrent_state_queries_share_one_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/states/all"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(states_body())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, |_| {}).await;

    let results = join_all((0..5).map(|_| services.flights.states(StatesQuery::default()))).await;
    for result in results {
        let entry = result.expect("states");
        assert_eq!(entry.data.states.len(), 1);
        assert_eq!(entry.data.states[0].callsign.as_deref(), Some("DLH9LF"));
    }
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tracks/all"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tracks/all"))
        .and(query_param("icao24", "3c6444"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "icao24": "3c6444",
            "callsign": "DLH9LF",
            "startTime": 100,
            "endTime": 200,
            "path": [[100, 50.0, 6.0, 1000.0, 90.0, false]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, |_| {}).await;

    let track = services.flights.track("3C6444", 0).await.expect("track after retry");
    assert_eq!(track.data.path.len(), 1);
}

#[tokio::test]
async fn flight_calls_carry_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "flight-token",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flights/arrival"))
        .and(header("authorization", "Bearer flight-token"))
        .and(query_param("airport", "EDDF"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "icao24": "3c6444",
            "callsign": "DLH9LF",
            "firstSeen": 1_700_000_000,
            "lastSeen": 1_700_003_600,
            "estDepartureAirport": "EGLL",
            "estArrivalAirport": "EDDF"
        }])))
        .expect(2)
        .mount(&server)
        .await;

    let token_url = format!("{}/oauth/token", server.uri());
    let services = services(&server, |cfg| {
        cfg.auth.oauth.client_id = "skyrelay".into();
        cfg.auth.oauth.client_secret = "s3cret".into();
        cfg.auth.oauth.token_url = token_url;
    })
    .await;

    let arrivals = services
        .flights
        .arrivals("eddf", 1_700_000_000, 1_700_086_400)
        .await
        .expect("arrivals");
    assert_eq!(arrivals.data[0].est_departure_airport.as_deref(), Some("EGLL"));

    // Different interval, new upstream call, same token.
    services
        .flights
        .arrivals("EDDF", 1_700_000_000, 1_700_043_200)
        .await
        .expect("arrivals");
}

#[tokio::test]
async fn endpoint_budget_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tracks/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "icao24": "3c6444",
            "startTime": 100,
            "endTime": 200,
            "path": []
        })))
        .expect(2)
        .mount(&server)
        .await;

    let services = services(&server, |cfg| {
        cfg.rate_limit.classes = HashMap::from([(
            "flights".to_string(),
            RateLimitRule::new(2, 60_000, RateLimitAlgorithm::Sliding),
        )]);
    })
    .await;

    services.flights.track("3c6444", 100).await.expect("first");
    services.flights.track("3c6444", 200).await.expect("second");
    let err = services.flights.track("3c6444", 300).await.expect_err("over budget");
    assert_eq!(err.status_code(), 429);
    assert!(err.retry_after_seconds().is_some_and(|s| s >= 1));

    // Cached entries are still served.
    services.flights.track("3c6444", 100).await.expect("cached");
}
