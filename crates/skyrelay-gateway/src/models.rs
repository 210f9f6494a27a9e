//! Payloads served from the cache.
//!
//! The flight API encodes state vectors and track waypoints as positional
//! JSON arrays; they are converted into named structs at the client edge so
//! the cached form is self-describing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Airport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airport {
    /// ICAO code or local identifier
    pub ident: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub iata_code: Option<String>,
    #[serde(default)]
    pub icao_code: Option<String>,
    #[serde(default)]
    pub latitude_deg: Option<f64>,
    #[serde(default)]
    pub longitude_deg: Option<f64>,
    #[serde(default)]
    pub elevation_ft: Option<f64>,
    #[serde(default)]
    pub iso_country: Option<String>,
    #[serde(default)]
    pub municipality: Option<String>,
}

/// One aircraft state vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightState {
    pub icao24: String,
    pub callsign: Option<String>,
    pub origin_country: String,
    pub time_position: Option<i64>,
    pub last_contact: i64,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub squawk: Option<String>,
    pub spi: bool,
    pub position_source: i64,
}

impl FlightState {
    /// Parse one positional row of a `/states/all` response.
    pub fn from_row(row: &[Value]) -> Result<Self, String> {
        let icao24 = row
            .first()
            .and_then(Value::as_str)
            .ok_or("state vector without icao24")?
            .to_string();

        Ok(Self {
            icao24,
            callsign: opt_str(row, 1).map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            origin_country: opt_str(row, 2).unwrap_or_default().to_string(),
            time_position: opt_i64(row, 3),
            last_contact: opt_i64(row, 4).unwrap_or_default(),
            longitude: opt_f64(row, 5),
            latitude: opt_f64(row, 6),
            baro_altitude: opt_f64(row, 7),
            on_ground: opt_bool(row, 8),
            velocity: opt_f64(row, 9),
            true_track: opt_f64(row, 10),
            vertical_rate: opt_f64(row, 11),
            // 12: receiver ids, not kept
            geo_altitude: opt_f64(row, 13),
            squawk: opt_str(row, 14).map(str::to_string),
            spi: opt_bool(row, 15),
            position_source: opt_i64(row, 16).unwrap_or_default(),
        })
    }
}

/// Response of a state query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightStates {
    /// Unix seconds the states are valid for
    pub time: i64,
    pub states: Vec<FlightState>,
}

#[derive(Deserialize)]
pub(crate) struct RawStates {
    pub time: i64,
    #[serde(default)]
    pub states: Option<Vec<Vec<Value>>>,
}

impl TryFrom<RawStates> for FlightStates {
    type Error = String;

    fn try_from(raw: RawStates) -> Result<Self, Self::Error> {
        let states = raw
            .states
            .unwrap_or_default()
            .iter()
            .map(|row| FlightState::from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            time: raw.time,
            states,
        })
    }
}

/// A point on an aircraft's path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub time: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub true_track: Option<f64>,
    pub on_ground: bool,
}

impl Waypoint {
    pub fn from_row(row: &[Value]) -> Result<Self, String> {
        Ok(Self {
            time: opt_i64(row, 0).ok_or("waypoint without time")?,
            latitude: opt_f64(row, 1),
            longitude: opt_f64(row, 2),
            baro_altitude: opt_f64(row, 3),
            true_track: opt_f64(row, 4),
            on_ground: opt_bool(row, 5),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub icao24: String,
    pub callsign: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub path: Vec<Waypoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTrack {
    pub icao24: String,
    #[serde(default)]
    pub callsign: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub path: Vec<Vec<Value>>,
}

impl TryFrom<RawTrack> for Track {
    type Error = String;

    fn try_from(raw: RawTrack) -> Result<Self, Self::Error> {
        let path = raw
            .path
            .iter()
            .map(|row| Waypoint::from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            icao24: raw.icao24,
            callsign: raw.callsign.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            start_time: raw.start_time,
            end_time: raw.end_time,
            path,
        })
    }
}

/// A flight seen arriving at or departing from an airport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightRecord {
    pub icao24: String,
    #[serde(default)]
    pub callsign: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    #[serde(default)]
    pub est_departure_airport: Option<String>,
    #[serde(default)]
    pub est_arrival_airport: Option<String>,
}

fn opt_str(row: &[Value], idx: usize) -> Option<&str> {
    row.get(idx).and_then(Value::as_str)
}

fn opt_f64(row: &[Value], idx: usize) -> Option<f64> {
    row.get(idx).and_then(Value::as_f64)
}

fn opt_i64(row: &[Value], idx: usize) -> Option<i64> {
    row.get(idx).and_then(Value::as_i64)
}

fn opt_bool(row: &[Value], idx: usize) -> bool {
    row.get(idx).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_row_parsing() {
        let raw: RawStates = serde_json::from_value(json!({
            "time": 1_700_000_000,
            "states": [[
                "3c6444", "DLH9LF  ", "Germany", 1_700_000_000, 1_700_000_001,
                6.1, 50.2, 9_144.0, false, 231.3, 98.2, -0.3, null, 9_300.0, "1000", false, 0
            ]]
        }))
        .unwrap();

        let states = FlightStates::try_from(raw).unwrap();
        let state = &states.states[0];
        assert_eq!(state.icao24, "3c6444");
        assert_eq!(state.callsign.as_deref(), Some("DLH9LF"));
        assert_eq!(state.baro_altitude, Some(9_144.0));
        assert_eq!(state.squawk.as_deref(), Some("1000"));
        assert!(!state.on_ground);
    }

    #[test]
    fn test_empty_states_is_not_an_error() {
        let raw: RawStates = serde_json::from_value(json!({"time": 1, "states": null})).unwrap();
        assert!(FlightStates::try_from(raw).unwrap().states.is_empty());
    }

    #[test]
    fn test_track_parsing() {
        let raw: RawTrack = serde_json::from_value(json!({
            "icao24": "3c6444",
            "callsign": "DLH9LF ",
            "startTime": 100,
            "endTime": 200,
            "path": [[100, 50.0, 6.0, 1000.0, 90.0, false], [200, 50.1, 6.1, null, 91.0, true]]
        }))
        .unwrap();

        let track = Track::try_from(raw).unwrap();
        assert_eq!(track.path.len(), 2);
        assert_eq!(track.path[1].baro_altitude, None);
        assert!(track.path[1].on_ground);
        assert_eq!(track.callsign.as_deref(), Some("DLH9LF"));
    }

    #[test]
    fn test_malformed_row_rejected() {
        assert!(FlightState::from_row(&[json!(42)]).is_err());
        assert!(Waypoint::from_row(&[json!("x")]).is_err());
    }
}
