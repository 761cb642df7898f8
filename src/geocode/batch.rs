//! Bulk geocoding through the Census address-batch endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hashbrown::{HashMap, HashSet};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{http_client, rejoin, GeocodeSummary};
use crate::address::zip5;
use crate::cache::{flush_blocking, CacheStore};
use crate::geography::extract_geoids;
use crate::models::{GeocodeResult, GeocodeStatus, ProviderRecord};
use crate::progress;
use crate::retry::{Attempt, RetryPolicy};

const BENCHMARK: &str = "Public_AR_Current";
const VINTAGE: &str = "Current_Current";
const BATCH_FAILED: &str = "BATCH_FAILED";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            retry: RetryPolicy::batch(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// One parsed response row
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMatch {
    pub status: GeocodeStatus,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub county_geoid: String,
    pub tract_geoid: String,
}

fn batch_status(raw: &str) -> GeocodeStatus {
    match raw.trim() {
        "Match" => GeocodeStatus::Ok,
        "No_Match" => GeocodeStatus::ZeroResults,
        other => GeocodeStatus::from(other),
    }
}

/// Headerless `id,street,city,state,zip` upload; ids start at 1.
pub fn build_batch_file(records: &[&ProviderRecord]) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for (i, record) in records.iter().enumerate() {
        wtr.write_record([
            (i + 1).to_string(),
            record.street(),
            record.city.clone(),
            record.state.clone(),
            zip5(&record.zip),
        ])?;
    }
    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to assemble batch file: {}", e.error()))
}

/// Parse a batch response into rows keyed by their submitted id.
///
/// Rows with fewer than nine fields, or without a numeric id, are skipped.
pub fn parse_batch_response(body: &str) -> HashMap<usize, BatchMatch> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut out = HashMap::new();
    for row in rdr.records() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping unreadable batch row: {}", e);
                continue;
            }
        };
        if row.len() < 9 {
            continue;
        }
        let Ok(id) = row[0].trim().parse::<usize>() else {
            continue;
        };

        let (county_geoid, tract_geoid) = row
            .get(9)
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .map(|json| extract_geoids(json.get("geographies").unwrap_or(&Value::Null)))
            .unwrap_or_default();

        out.insert(
            id,
            BatchMatch {
                status: batch_status(&row[5]),
                lon: row[7].trim().parse().ok(),
                lat: row[8].trim().parse().ok(),
                county_geoid,
                tract_geoid,
            },
        );
    }
    out
}

pub struct BatchGeocoder {
    client: Client,
    endpoint: Url,
    cache: Arc<dyn CacheStore<GeocodeResult>>,
    options: BatchOptions,
}

impl BatchGeocoder {
    pub fn new(
        endpoint: Url,
        cache: Arc<dyn CacheStore<GeocodeResult>>,
        options: BatchOptions,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(options.timeout)?,
            endpoint,
            cache,
            options,
        })
    }

    /// Geocode records in fixed-size batches, reusing cached coordinates.
    ///
    /// Identifiers returned alongside batch matches are attached to the
    /// output records so the geoids stage can skip them.
    pub async fn geocode_records(
        &self,
        records: Vec<ProviderRecord>,
    ) -> Result<(Vec<ProviderRecord>, GeocodeSummary)> {
        let mut summary = GeocodeSummary {
            input_rows: records.len(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let mut pending: Vec<&ProviderRecord> = Vec::new();
        for record in &records {
            let key = record.address_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.cache.get(&key) {
                Some(hit) if hit.coordinates().is_some() => summary.cached += 1,
                _ => pending.push(record),
            }
        }
        summary.unique_addresses = seen.len();

        let batch_size = self.options.batch_size.max(1);
        info!(
            "Unique addresses: {}; to geocode: {} in {} batches of up to {}; cached: {}",
            summary.unique_addresses,
            pending.len(),
            pending.len().div_ceil(batch_size),
            batch_size,
            summary.cached
        );

        let mut geoids: HashMap<String, (String, String)> = HashMap::new();
        let mut failed_keys: HashSet<String> = HashSet::new();

        if !pending.is_empty() {
            let pb = progress::bar(pending.len() as u64, "batch geocoding")?;
            for (n, chunk) in pending.chunks(batch_size).enumerate() {
                summary.batches_submitted += 1;
                summary.requested += chunk.len();

                let body = match self.submit(chunk).await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Batch {} ({} addresses) failed: {:#}", n + 1, chunk.len(), e);
                        summary.batches_failed += 1;
                        summary.failed_now += chunk.len();
                        failed_keys.extend(chunk.iter().map(|r| r.address_key()));
                        pb.inc(chunk.len() as u64);
                        continue;
                    }
                };

                let matches = parse_batch_response(&body);
                for (i, record) in chunk.iter().enumerate() {
                    let key = record.address_key();
                    // Ids missing from the response stay uncached
                    let Some(m) = matches.get(&(i + 1)) else {
                        summary.failed_now += 1;
                        continue;
                    };
                    let query = record.address_full();
                    let result = match (m.status == GeocodeStatus::Ok, m.lat, m.lon) {
                        (true, Some(lat), Some(lon)) => {
                            GeocodeResult::resolved(&key, &query, lat, lon, String::new())
                        }
                        (true, _, _) => GeocodeResult::unresolved(
                            &key,
                            &query,
                            GeocodeStatus::ZeroResults,
                        ),
                        _ => GeocodeResult::unresolved(&key, &query, m.status.clone()),
                    };
                    if result.coordinates().is_some() {
                        summary.resolved_now += 1;
                        if !m.county_geoid.is_empty() || !m.tract_geoid.is_empty() {
                            geoids.insert(
                                key.clone(),
                                (m.county_geoid.clone(), m.tract_geoid.clone()),
                            );
                        }
                    } else {
                        summary.failed_now += 1;
                    }
                    self.cache.put(key, result);
                }

                flush_blocking(&self.cache).await?;
                pb.inc(chunk.len() as u64);
                info!(
                    "Batch {}: {} rows parsed for {} addresses",
                    n + 1,
                    matches.len(),
                    chunk.len()
                );
            }
            pb.finish_with_message("batch geocoding complete");
        }

        let (lost, rest): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| failed_keys.contains(&r.address_key()));
        if !lost.is_empty() {
            *summary.dropped.entry(BATCH_FAILED.to_string()).or_default() += lost.len();
        }

        let mut located = rejoin(rest, self.cache.as_ref(), &mut summary);
        for record in &mut located {
            if let Some((county, tract)) = geoids.get(&record.address_key()) {
                record.county_geoid = Some(county.clone()).filter(|s| !s.is_empty());
                record.tract_geoid = Some(tract.clone()).filter(|s| !s.is_empty());
            }
        }
        Ok((located, summary))
    }

    async fn submit(&self, chunk: &[&ProviderRecord]) -> Result<String> {
        let file = build_batch_file(chunk)?;

        let outcome = self
            .options
            .retry
            .run(|attempt| {
                let file = file.clone();
                async move {
                    let form = Form::new()
                        .text("benchmark", BENCHMARK)
                        .text("vintage", VINTAGE)
                        .part("addressFile", Part::bytes(file).file_name("addresses.csv"));

                    let response = match self
                        .client
                        .post(self.endpoint.clone())
                        .multipart(form)
                        .send()
                        .await
                    {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("Batch upload attempt {} failed: {}", attempt + 1, e);
                            return Attempt::Retry(e.to_string());
                        }
                    };

                    let status = response.status();
                    if status.is_server_error() {
                        return Attempt::Retry(format!("HTTP {}", status));
                    }
                    if !status.is_success() {
                        return Attempt::Done(Err(format!("HTTP {}", status)));
                    }
                    match response.text().await {
                        Ok(body) => Attempt::Done(Ok(body)),
                        Err(e) => Attempt::Retry(e.to_string()),
                    }
                }
            })
            .await;

        match outcome {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(reason)) => anyhow::bail!("batch rejected: {}", reason),
            Err(reason) => anyhow::bail!("batch gave up after retries: {}", reason),
        }
    }
}
