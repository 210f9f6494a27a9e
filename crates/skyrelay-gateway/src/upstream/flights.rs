use std::str::FromStr;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Serialize;
use skyrelay_cache::{CacheEntry, CacheKey, Result, UpstreamError, namespaces};

use super::{endpoint, normalize_airport_code, send_json};
use crate::config::CacheTtlConfig;
use crate::fetcher::{CachedFetcher, endpoints};
use crate::models::{FlightRecord, FlightStates, RawStates, RawTrack, Track};

/// Longest arrivals/departures interval the API accepts.
pub const MAX_INTERVAL_SECS: i64 = 7 * 24 * 3600;

/// Lower-case and check a 24-bit transponder address in hex.
pub fn normalize_icao24(icao24: &str) -> std::result::Result<String, UpstreamError> {
    let icao24 = icao24.trim().to_ascii_lowercase();
    if icao24.len() == 6 && icao24.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(icao24)
    } else {
        Err(UpstreamError::InvalidRequest(format!(
            "'{icao24}' is not a 6-digit hex ICAO24 address"
        )))
    }
}

fn check_interval(begin: i64, end: i64) -> std::result::Result<(), UpstreamError> {
    if end <= begin {
        return Err(UpstreamError::InvalidRequest("end must be after begin".into()));
    }
    if end - begin > MAX_INTERVAL_SECS {
        return Err(UpstreamError::InvalidRequest(
            "interval must not exceed 7 days".into(),
        ));
    }
    Ok(())
}

/// Geographic filter: `lamin,lomin,lamax,lomax` in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub lamin: f64,
    pub lomin: f64,
    pub lamax: f64,
    pub lomax: f64,
}

impl FromStr for BoundingBox {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>().map_err(|e| format!("invalid coordinate '{p}': {e}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let [lamin, lomin, lamax, lomax] = parts[..] else {
            return Err("expected lamin,lomin,lamax,lomax".into());
        };
        if !(-90.0..=90.0).contains(&lamin) || !(-90.0..=90.0).contains(&lamax) || lamin > lamax {
            return Err("latitudes must be within -90..90 with lamin <= lamax".into());
        }
        if !(-180.0..=180.0).contains(&lomin)
            || !(-180.0..=180.0).contains(&lomax)
            || lomin > lomax
        {
            return Err("longitudes must be within -180..180 with lomin <= lomax".into());
        }

        Ok(Self {
            lamin,
            lomin,
            lamax,
            lomax,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatesQuery {
    pub icao24: Option<String>,
    pub bbox: Option<BoundingBox>,
}

impl StatesQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(icao24) = &self.icao24 {
            params.push(("icao24", icao24.clone()));
        }
        if let Some(bbox) = &self.bbox {
            params.push(("lamin", bbox.lamin.to_string()));
            params.push(("lomin", bbox.lomin.to_string()));
            params.push(("lamax", bbox.lamax.to_string()));
            params.push(("lomax", bbox.lomax.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Arrival,
    Departure,
}

impl Direction {
    fn path(self) -> &'static str {
        match self {
            Direction::Arrival => "flights/arrival",
            Direction::Departure => "flights/departure",
        }
    }

    fn namespace(self) -> &'static str {
        match self {
            Direction::Arrival => namespaces::ARRIVALS,
            Direction::Departure => namespaces::DEPARTURES,
        }
    }
}

/// Client for the flight-state API. Every call carries auth headers.
#[derive(Debug, Clone)]
pub struct FlightClient {
    http: reqwest::Client,
    base_url: String,
}

impl FlightClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// `GET /states/all`
    pub async fn states(
        &self,
        query: &StatesQuery,
        auth: HeaderMap,
    ) -> std::result::Result<FlightStates, UpstreamError> {
        let request = self
            .http
            .get(endpoint(&self.base_url, "states/all"))
            .headers(auth)
            .query(&query.params());

        let raw: RawStates = send_json(request, "flights", "states").await?;
        FlightStates::try_from(raw).map_err(UpstreamError::Decode)
    }

    /// `GET /tracks/all`; `time` 0 means the live track.
    pub async fn track(
        &self,
        icao24: &str,
        time: i64,
        auth: HeaderMap,
    ) -> std::result::Result<Track, UpstreamError> {
        let icao24 = normalize_icao24(icao24)?;
        let request = self
            .http
            .get(endpoint(&self.base_url, "tracks/all"))
            .headers(auth)
            .query(&[("icao24", icao24.clone()), ("time", time.to_string())]);

        let raw: RawTrack = send_json(request, "flights", &format!("track {icao24}")).await?;
        Track::try_from(raw).map_err(UpstreamError::Decode)
    }

    pub async fn arrivals(
        &self,
        airport: &str,
        begin: i64,
        end: i64,
        auth: HeaderMap,
    ) -> std::result::Result<Vec<FlightRecord>, UpstreamError> {
        self.schedule(Direction::Arrival, airport, begin, end, auth).await
    }

    pub async fn departures(
        &self,
        airport: &str,
        begin: i64,
        end: i64,
        auth: HeaderMap,
    ) -> std::result::Result<Vec<FlightRecord>, UpstreamError> {
        self.schedule(Direction::Departure, airport, begin, end, auth).await
    }

    async fn schedule(
        &self,
        direction: Direction,
        airport: &str,
        begin: i64,
        end: i64,
        auth: HeaderMap,
    ) -> std::result::Result<Vec<FlightRecord>, UpstreamError> {
        let airport = normalize_airport_code(airport)?;
        check_interval(begin, end)?;

        let request = self
            .http
            .get(endpoint(&self.base_url, direction.path()))
            .headers(auth)
            .query(&[
                ("airport", airport.clone()),
                ("begin", begin.to_string()),
                ("end", end.to_string()),
            ]);

        send_json(request, "flights", &format!("{} {airport}", direction.namespace())).await
    }
}

/// Cached flight queries.
#[derive(Debug, Clone)]
pub struct FlightService {
    client: FlightClient,
    fetcher: CachedFetcher,
    ttl: CacheTtlConfig,
}

impl FlightService {
    pub fn new(client: FlightClient, fetcher: CachedFetcher, ttl: CacheTtlConfig) -> Self {
        Self { client, fetcher, ttl }
    }

    pub async fn states(&self, query: StatesQuery) -> Result<CacheEntry<FlightStates>> {
        let query = StatesQuery {
            icao24: query.icao24.as_deref().map(normalize_icao24).transpose()?,
            bbox: query.bbox,
        };
        let key = CacheKey::hashed(namespaces::FLIGHT_STATE, query.params());

        let client = self.client.clone();
        self.fetcher
            .fetch(
                &key,
                self.ttl.for_namespace(namespaces::FLIGHT_STATE),
                endpoints::FLIGHTS,
                move |auth| {
                    let client = client.clone();
                    let query = query.clone();
                    async move { client.states(&query, auth).await }
                },
            )
            .await
    }

    pub async fn track(&self, icao24: &str, time: i64) -> Result<CacheEntry<Track>> {
        let icao24 = normalize_icao24(icao24)?;
        let key = CacheKey::new(namespaces::TRACK, &format!("{icao24}-{time}"));

        let client = self.client.clone();
        self.fetcher
            .fetch(
                &key,
                self.ttl.for_namespace(namespaces::TRACK),
                endpoints::FLIGHTS,
                move |auth| {
                    let client = client.clone();
                    let icao24 = icao24.clone();
                    async move { client.track(&icao24, time, auth).await }
                },
            )
            .await
    }

    pub async fn arrivals(
        &self,
        airport: &str,
        begin: i64,
        end: i64,
    ) -> Result<CacheEntry<Vec<FlightRecord>>> {
        self.schedule(Direction::Arrival, airport, begin, end).await
    }

    pub async fn departures(
        &self,
        airport: &str,
        begin: i64,
        end: i64,
    ) -> Result<CacheEntry<Vec<FlightRecord>>> {
        self.schedule(Direction::Departure, airport, begin, end).await
    }

    async fn schedule(
        &self,
        direction: Direction,
        airport: &str,
        begin: i64,
        end: i64,
    ) -> Result<CacheEntry<Vec<FlightRecord>>> {
        let airport = normalize_airport_code(airport)?;
        check_interval(begin, end)?;

        let namespace = direction.namespace();
        let key = CacheKey::hashed(
            namespace,
            [
                ("airport", airport.clone()),
                ("begin", begin.to_string()),
                ("end", end.to_string()),
            ],
        );

        let client = self.client.clone();
        self.fetcher
            .fetch(
                &key,
                self.ttl.for_namespace(namespace),
                endpoints::FLIGHTS,
                move |auth| {
                    let client = client.clone();
                    let airport = airport.clone();
                    async move { client.schedule(direction, &airport, begin, end, auth).await }
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icao24_normalization() {
        assert_eq!(normalize_icao24("3C6444").unwrap(), "3c6444");
        assert!(normalize_icao24("3c644").is_err());
        assert!(normalize_icao24("zz6444").is_err());
    }

    #[test]
    fn test_interval_limits() {
        assert!(check_interval(0, 3600).is_ok());
        assert!(check_interval(0, MAX_INTERVAL_SECS).is_ok());
        assert!(check_interval(0, MAX_INTERVAL_SECS + 1).is_err());
        assert!(check_interval(100, 100).is_err());
    }

    #[test]
    fn test_bbox_parsing() {
        let bbox: BoundingBox = "45.8,5.9,47.8,10.5".parse().unwrap();
        assert_eq!(bbox.lamax, 47.8);
        assert!("45.8,5.9,47.8".parse::<BoundingBox>().is_err());
        assert!("50,5,40,10".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_state_query_keys_are_stable() {
        let query = StatesQuery {
            icao24: Some("3c6444".into()),
            bbox: None,
        };
        let a = CacheKey::hashed(namespaces::FLIGHT_STATE, query.params());
        let b = CacheKey::hashed(namespaces::FLIGHT_STATE, query.params());
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::hashed(namespaces::FLIGHT_STATE, StatesQuery::default().params()));
    }
}
