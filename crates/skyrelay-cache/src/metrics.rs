//! Metric names and recording helpers.
//!
//! Recording is a no-op until the embedding process installs a `metrics`
//! recorder.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "skyrelay_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "skyrelay_cache_misses_total";
    pub const CACHE_BACKEND_ERRORS_TOTAL: &str = "skyrelay_cache_backend_errors_total";
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "skyrelay_circuit_transitions_total";
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "skyrelay_circuit_rejections_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "skyrelay_rate_limit_rejections_total";
    pub const LOCK_FALLBACKS_TOTAL: &str = "skyrelay_lock_fallbacks_total";
    pub const SINGLE_FLIGHT_JOINS_TOTAL: &str = "skyrelay_single_flight_joins_total";
    pub const TOKEN_FETCHES_TOTAL: &str = "skyrelay_token_fetches_total";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "skyrelay_upstream_requests_total";
}

pub fn record_cache_hit(namespace: &str, tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "namespace" => namespace.to_string(), "tier" => tier)
        .increment(1);
}

pub fn record_cache_miss(namespace: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "namespace" => namespace.to_string()).increment(1);
}

pub fn record_backend_error(operation: &'static str) {
    counter!(names::CACHE_BACKEND_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_circuit_transition(breaker: &str, to: &'static str) {
    counter!(names::CIRCUIT_TRANSITIONS_TOTAL, "breaker" => breaker.to_string(), "to" => to)
        .increment(1);
}

pub fn record_circuit_rejection(breaker: &str) {
    counter!(names::CIRCUIT_REJECTIONS_TOTAL, "breaker" => breaker.to_string()).increment(1);
}

pub fn record_rate_limit_rejection(class: &str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "class" => class.to_string()).increment(1);
}

pub fn record_lock_fallback() {
    counter!(names::LOCK_FALLBACKS_TOTAL).increment(1);
}

pub fn record_single_flight_join() {
    counter!(names::SINGLE_FLIGHT_JOINS_TOTAL).increment(1);
}

pub fn record_token_fetch(outcome: &'static str) {
    counter!(names::TOKEN_FETCHES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_upstream_request(api: &'static str, outcome: &'static str) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "api" => api, "outcome" => outcome).increment(1);
}
