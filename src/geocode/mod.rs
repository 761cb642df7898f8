//! Address → coordinate resolution.
//!
//! Two engines share the geocode cache: [`InteractiveGeocoder`] resolves one
//! address per request under a rate limit, [`BatchGeocoder`] submits
//! fixed-size address files to a bulk endpoint.

mod batch;
mod interactive;

pub use batch::{build_batch_file, parse_batch_response, BatchGeocoder, BatchMatch, BatchOptions};
pub use interactive::{InteractiveGeocoder, InteractiveOptions};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::cache::CacheStore;
use crate::models::{GeocodeResult, ProviderRecord};

const USER_AGENT: &str = "caremap/0.1 (provider enrichment pipeline)";

/// Engine selected for the geocode stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Engine {
    Google,
    Census,
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Counts for one geocode run.
///
/// `dropped` maps the outcome that kept a record out of the output (geocoder
/// status, or a pipeline reason such as `BATCH_FAILED`) to its record count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeocodeSummary {
    pub input_rows: usize,
    pub unique_addresses: usize,
    pub cached: usize,
    pub requested: usize,
    pub resolved_now: usize,
    pub failed_now: usize,
    pub batches_submitted: usize,
    pub batches_failed: usize,
    pub output_rows: usize,
    pub dropped: BTreeMap<String, usize>,
}

impl GeocodeSummary {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }
}

impl fmt::Display for GeocodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows ({} unique addresses, {} cached): requested {}, resolved {}, failed {}",
            self.input_rows,
            self.unique_addresses,
            self.cached,
            self.requested,
            self.resolved_now,
            self.failed_now
        )?;
        if self.batches_submitted > 0 {
            write!(
                f,
                ", batches {} ({} failed)",
                self.batches_submitted, self.batches_failed
            )?;
        }
        write!(f, "; wrote {} rows", self.output_rows)?;
        if !self.dropped.is_empty() {
            let reasons: Vec<String> = self
                .dropped
                .iter()
                .map(|(reason, n)| format!("{} {}", reason, n))
                .collect();
            write!(
                f,
                ", dropped {} unlocated ({})",
                self.dropped_total(),
                reasons.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Copy a cached geocode onto a record
pub(crate) fn apply_geocode(record: &mut ProviderRecord, result: &GeocodeResult) {
    record.lat = result.lat;
    record.lon = result.lon;
    record.geocode_status = Some(result.status.to_string());
    record.place_id = if result.place_id.is_empty() {
        None
    } else {
        Some(result.place_id.clone())
    };
}

/// Re-join the ordered records against the cache, keeping only located ones.
///
/// Unlocated records are removed from the enriched output on purpose; each
/// is counted in `summary.dropped` under its cached status.
pub(crate) fn rejoin(
    records: Vec<ProviderRecord>,
    cache: &dyn CacheStore<GeocodeResult>,
    summary: &mut GeocodeSummary,
) -> Vec<ProviderRecord> {
    let mut out = Vec::with_capacity(records.len());
    for mut record in records {
        match cache.get(&record.address_key()) {
            Some(result) if result.coordinates().is_some() => {
                apply_geocode(&mut record, &result);
                out.push(record);
            }
            Some(result) => *summary.dropped.entry(result.status.to_string()).or_default() += 1,
            None => *summary.dropped.entry("NOT_GEOCODED".to_string()).or_default() += 1,
        }
    }
    summary.output_rows = out.len();
    out
}
