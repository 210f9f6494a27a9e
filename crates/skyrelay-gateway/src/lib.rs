//! Airport and flight-state lookups behind the skyrelay resilience layer.
//!
//! Configuration is loaded from `skyrelay.toml` plus `SKYRELAY__*`
//! environment overrides ([`config::loader::load_config`]), secrets are
//! resolved through [`skyrelay_config::SecretsProvider`], and
//! [`Services::initialize`] wires the cache, locks, rate limiter and token
//! cache in front of the upstream clients.

pub mod config;
pub mod fetcher;
pub mod models;
pub mod observability;
pub mod services;
pub mod upstream;

pub use config::AppConfig;
pub use fetcher::{CachedFetcher, Endpoint, endpoints};
pub use models::{Airport, FlightRecord, FlightState, FlightStates, Track, Waypoint};
pub use services::{InitError, Services};
