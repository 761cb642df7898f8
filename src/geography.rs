//! Coordinate → county / census tract identifiers via the Census
//! coordinates endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{flush_blocking, CacheStore};
use crate::geocode::http_client;
use crate::models::{coordinate_key, GeoIdResult, ProviderRecord};
use crate::progress;

pub const DEFAULT_SAVE_EVERY: usize = 200;
pub const DEFAULT_MISS_DELAY: Duration = Duration::from_millis(50);
const TRACT_LEN: usize = 11;

/// Pull county and tract GEOIDs out of a `geographies` object.
///
/// Missing layers give empty strings. The tract falls back to the first
/// eleven characters of the block GEOID when no tract layer is present.
pub fn extract_geoids(geographies: &Value) -> (String, String) {
    let first_geoid = |layer: &str| -> Option<String> {
        geographies
            .get(layer)?
            .get(0)?
            .get("GEOID")?
            .as_str()
            .map(str::to_string)
    };

    let county = first_geoid("Counties").unwrap_or_default();
    let tract = first_geoid("Census Tracts")
        .or_else(|| {
            first_geoid("Census Blocks")
                .and_then(|block| block.get(..TRACT_LEN).map(str::to_string))
        })
        .unwrap_or_default();
    (county, tract)
}

/// Where a resolved identifier pair came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Cached,
    Fetched,
    /// Request failed; identifiers are empty and nothing was cached
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoidSummary {
    pub input_rows: usize,
    pub no_coordinates: usize,
    pub passed_through: usize,
    pub cached: usize,
    pub fetched: usize,
    pub failed: usize,
    pub output_rows: usize,
}

impl fmt::Display for GeoidSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows: {} already tagged, {} cached, {} fetched, {} failed; dropped {} without coordinates; wrote {} rows",
            self.input_rows,
            self.passed_through,
            self.cached,
            self.fetched,
            self.failed,
            self.no_coordinates,
            self.output_rows
        )
    }
}

pub struct GeographyResolver {
    client: Client,
    endpoint: Url,
    cache: Arc<dyn CacheStore<GeoIdResult>>,
    save_every: usize,
    miss_delay: Duration,
}

impl GeographyResolver {
    pub fn new(endpoint: Url, cache: Arc<dyn CacheStore<GeoIdResult>>) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(20))?,
            endpoint,
            cache,
            save_every: DEFAULT_SAVE_EVERY,
            miss_delay: DEFAULT_MISS_DELAY,
        })
    }

    pub fn with_save_every(mut self, n: usize) -> Self {
        self.save_every = n.max(1);
        self
    }

    pub fn with_miss_delay(mut self, delay: Duration) -> Self {
        self.miss_delay = delay;
        self
    }

    async fn fetch(&self, lat: f64, lon: f64) -> Result<(String, String)> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("x", lon.to_string()),
                ("y", lat.to_string()),
                ("benchmark", "Public_AR_Current".to_string()),
                ("vintage", "Current_Current".to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await
            .context("geography request failed")?
            .error_for_status()
            .context("geography request rejected")?;

        let body: Value = response
            .json()
            .await
            .context("geography response was not JSON")?;
        let geographies = body
            .pointer("/result/geographies")
            .cloned()
            .unwrap_or(Value::Null);
        Ok(extract_geoids(&geographies))
    }

    /// Identifiers for one coordinate, from the cache or the network.
    pub async fn resolve(&self, lat: f64, lon: f64) -> (GeoIdResult, Lookup) {
        let key = coordinate_key(lat, lon);
        if let Some(hit) = self.cache.get(&key) {
            return (hit, Lookup::Cached);
        }

        match self.fetch(lat, lon).await {
            Ok((county, tract)) => {
                let result = GeoIdResult::new(lat, lon, county, tract);
                self.cache.put(key, result.clone());
                (result, Lookup::Fetched)
            }
            Err(e) => {
                warn!("Geography lookup for {} failed: {:#}", key, e);
                (
                    GeoIdResult::new(lat, lon, String::new(), String::new()),
                    Lookup::Failed,
                )
            }
        }
    }

    /// Attach identifiers to every record that has coordinates.
    pub async fn tag_geoids(
        &self,
        records: Vec<ProviderRecord>,
    ) -> Result<(Vec<ProviderRecord>, GeoidSummary)> {
        let mut summary = GeoidSummary {
            input_rows: records.len(),
            ..Default::default()
        };
        info!("Loaded {} cached coordinate lookups", self.cache.len());

        let pb = progress::bar(records.len() as u64, "tagging geoids")?;
        let mut out = Vec::with_capacity(records.len());
        let mut new_entries = 0usize;

        for mut record in records {
            pb.inc(1);
            let Some((lat, lon)) = record.coordinates() else {
                summary.no_coordinates += 1;
                continue;
            };
            if record.has_geoids() {
                summary.passed_through += 1;
                out.push(record);
                continue;
            }

            let (ids, lookup) = self.resolve(lat, lon).await;
            match lookup {
                Lookup::Cached => summary.cached += 1,
                Lookup::Fetched => {
                    summary.fetched += 1;
                    new_entries += 1;
                    if new_entries % self.save_every == 0 {
                        flush_blocking(&self.cache).await?;
                        debug!("Geoid cache flushed at {} entries", self.cache.len());
                    }
                }
                Lookup::Failed => summary.failed += 1,
            }
            if lookup != Lookup::Cached && !self.miss_delay.is_zero() {
                tokio::time::sleep(self.miss_delay).await;
            }

            record.county_geoid = non_empty(ids.county_geoid);
            record.tract_geoid = non_empty(ids.tract_geoid);
            out.push(record);
        }

        flush_blocking(&self.cache).await?;
        pb.finish_with_message("geoids complete");
        summary.output_rows = out.len();
        Ok((out, summary))
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::CountingCache;
    use crate::cache::FileCache;
    use crate::models::provider::sample_record;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_extract_prefers_tract_layer() {
        let geos = json!({
            "Counties": [{ "GEOID": "17031" }],
            "Census Tracts": [{ "GEOID": "17031081403" }],
            "Census Blocks": [{ "GEOID": "170310814031000" }]
        });
        assert_eq!(
            extract_geoids(&geos),
            ("17031".to_string(), "17031081403".to_string())
        );
    }

    #[test]
    fn test_extract_falls_back_to_block() {
        let geos = json!({
            "Counties": [{ "GEOID": "53033" }],
            "Census Blocks": [{ "GEOID": "530330081001002" }]
        });
        assert_eq!(extract_geoids(&geos).1, "53033008100");
    }

    #[test]
    fn test_extract_tolerates_missing_layers() {
        assert_eq!(extract_geoids(&json!({})), (String::new(), String::new()));
        assert_eq!(extract_geoids(&Value::Null), (String::new(), String::new()));
        assert_eq!(
            extract_geoids(&json!({ "Counties": [] })),
            (String::new(), String::new())
        );
    }

    fn located(npi: &str, lat: f64, lon: f64) -> ProviderRecord {
        let mut r = sample_record(npi, "1 A St");
        r.lat = Some(lat);
        r.lon = Some(lon);
        r
    }

    fn resolver(server: &MockServer, cache: Arc<FileCache<GeoIdResult>>) -> GeographyResolver {
        let endpoint = Url::parse(&format!("{}/coordinates", server.uri())).unwrap();
        GeographyResolver::new(endpoint, cache)
            .unwrap()
            .with_miss_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_tag_geoids_caches_and_reuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("benchmark", "Public_AR_Current"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "geographies": {
                    "Counties": [{ "GEOID": "17031" }],
                    "Census Tracts": [{ "GEOID": "17031081403" }]
                }}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geoids_cache.csv");
        let cache = Arc::new(FileCache::open(&path).unwrap());
        let geo = resolver(&server, cache);

        let mut no_coords = sample_record("3", "3 C St");
        no_coords.lat = None;
        let records = vec![
            located("1", 41.88, -87.63),
            located("2", 41.88, -87.63),
            no_coords,
        ];
        let (out, summary) = geo.tag_geoids(records).await.unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].county_geoid.as_deref(), Some("17031"));
        assert_eq!(out[1].tract_geoid.as_deref(), Some("17031081403"));
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.cached, 1);
        assert_eq!(summary.no_coordinates, 1);

        let reloaded: FileCache<GeoIdResult> = FileCache::open(&path).unwrap();
        let hit = reloaded.get("41.880000,-87.630000").unwrap();
        assert_eq!(hit.county_geoid, "17031");
    }

    #[tokio::test]
    async fn test_cache_flushed_every_save_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "geographies": {
                    "Counties": [{ "GEOID": "17031" }],
                    "Census Tracts": [{ "GEOID": "17031081403" }]
                }}
            })))
            .expect(5)
            .mount(&server)
            .await;

        let cache = Arc::new(CountingCache::<GeoIdResult>::new());
        let endpoint = Url::parse(&format!("{}/coordinates", server.uri())).unwrap();
        let geo = GeographyResolver::new(endpoint, cache.clone())
            .unwrap()
            .with_miss_delay(Duration::ZERO)
            .with_save_every(2);

        let records = (1..=5)
            .map(|i| located(&i.to_string(), 41.0 + f64::from(i) / 10.0, -87.63))
            .collect();
        let (out, summary) = geo.tag_geoids(records).await.unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(summary.fetched, 5);
        assert_eq!(cache.flushed_at(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let geo = resolver(&server, cache.clone());

        let (out, summary) = geo
            .tag_geoids(vec![located("1", 47.6, -122.3)])
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].county_geoid, None);
        assert_eq!(summary.failed, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_empty_response_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": { "geographies": {} } })),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let geo = resolver(&server, cache.clone());

        let (ids, lookup) = geo.resolve(10.0, 20.0).await;
        assert_eq!(lookup, Lookup::Fetched);
        assert_eq!(ids.county_geoid, "");
        assert!(cache.contains("10.000000,20.000000"));
    }

    #[tokio::test]
    async fn test_tagged_records_skip_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let geo = resolver(&server, cache);

        let mut record = located("1", 1.0, 2.0);
        record.county_geoid = Some("06075".into());
        record.tract_geoid = Some("06075010100".into());
        let (out, summary) = geo.tag_geoids(vec![record]).await.unwrap();
        assert_eq!(summary.passed_through, 1);
        assert_eq!(out[0].tract_geoid.as_deref(), Some("06075010100"));
    }
}
