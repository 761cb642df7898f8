//! Cached lookup results for the geocoding engines and the geography resolver.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::CacheEntry;

/// Geocoder outcome for one address, recorded verbatim when not one of the
/// well-known codes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeocodeStatus {
    Ok,
    ZeroResults,
    OverQueryLimit,
    RequestDenied,
    UnknownError,
    Other(String),
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            GeocodeStatus::Ok => "OK",
            GeocodeStatus::ZeroResults => "ZERO_RESULTS",
            GeocodeStatus::OverQueryLimit => "OVER_QUERY_LIMIT",
            GeocodeStatus::RequestDenied => "REQUEST_DENIED",
            GeocodeStatus::UnknownError => "UNKNOWN_ERROR",
            GeocodeStatus::Other(s) => s,
        }
    }

    /// Outcomes caused by the service rather than the address itself
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GeocodeStatus::OverQueryLimit | GeocodeStatus::UnknownError
        )
    }
}

impl From<String> for GeocodeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "OK" => GeocodeStatus::Ok,
            "ZERO_RESULTS" => GeocodeStatus::ZeroResults,
            "OVER_QUERY_LIMIT" => GeocodeStatus::OverQueryLimit,
            "REQUEST_DENIED" => GeocodeStatus::RequestDenied,
            "UNKNOWN_ERROR" => GeocodeStatus::UnknownError,
            _ => GeocodeStatus::Other(s),
        }
    }
}

impl From<&str> for GeocodeStatus {
    fn from(s: &str) -> Self {
        GeocodeStatus::from(s.to_string())
    }
}

impl From<GeocodeStatus> for String {
    fn from(status: GeocodeStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for GeocodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached geocode for one normalized address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    /// Normalized address key
    pub qkey: String,
    /// Literal query sent to the geocoder
    pub query: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub status: GeocodeStatus,
    #[serde(default)]
    pub place_id: String,
}

impl GeocodeResult {
    pub fn resolved(qkey: &str, query: &str, lat: f64, lon: f64, place_id: String) -> Self {
        Self {
            qkey: qkey.to_string(),
            query: query.to_string(),
            lat: Some(lat),
            lon: Some(lon),
            status: GeocodeStatus::Ok,
            place_id,
        }
    }

    pub fn unresolved(qkey: &str, query: &str, status: GeocodeStatus) -> Self {
        Self {
            qkey: qkey.to_string(),
            query: query.to_string(),
            lat: None,
            lon: None,
            status,
            place_id: String::new(),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.lat.zip(self.lon)
    }
}

impl CacheEntry for GeocodeResult {
    fn cache_key(&self) -> String {
        self.qkey.clone()
    }
}

/// Cached geography identifiers for one rounded coordinate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoIdResult {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub county_geoid: String,
    #[serde(default)]
    pub tract_geoid: String,
}

impl GeoIdResult {
    pub fn new(lat: f64, lon: f64, county_geoid: String, tract_geoid: String) -> Self {
        Self {
            lat: format!("{:.6}", lat),
            lon: format!("{:.6}", lon),
            county_geoid,
            tract_geoid,
        }
    }
}

impl CacheEntry for GeoIdResult {
    fn cache_key(&self) -> String {
        format!("{},{}", self.lat, self.lon)
    }
}

/// Coordinate rounded to six decimals, the geography cache key
pub fn coordinate_key(lat: f64, lon: f64) -> String {
    format!("{:.6},{:.6}", lat, lon)
}
