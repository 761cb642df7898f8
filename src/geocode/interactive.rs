//! Per-address geocoding against the Google Geocoding API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use hashbrown::HashSet;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{http_client, rejoin, GeocodeSummary};
use crate::cache::{flush_blocking, CacheStore};
use crate::models::{GeocodeResult, GeocodeStatus, ProviderRecord};
use crate::progress;
use crate::ratelimit::RateLimiter;
use crate::retry::{Attempt, RetryPolicy};

#[derive(Debug, Clone)]
pub struct InteractiveOptions {
    /// Requests per rolling second across all workers
    pub qps: usize,
    /// Requests in flight at once
    pub workers: usize,
    /// Flush the cache after this many completed lookups
    pub save_every: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Treat cached throttled/errored outcomes as misses
    pub retry_failed: bool,
}

impl Default for InteractiveOptions {
    fn default() -> Self {
        Self {
            qps: 10,
            workers: 10,
            save_every: 2000,
            retry: RetryPolicy::interactive(),
            timeout: Duration::from_secs(20),
            retry_failed: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeHit>,
}

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    geometry: Geometry,
    #[serde(default)]
    place_id: String,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Why an attempt should be retried
#[derive(Debug)]
enum Transient {
    Throttled,
    Failed(String),
}

/// Resolves addresses one request at a time with bounded concurrency.
pub struct InteractiveGeocoder {
    client: Client,
    endpoint: Url,
    api_key: String,
    limiter: Arc<RateLimiter>,
    cache: Arc<dyn CacheStore<GeocodeResult>>,
    options: InteractiveOptions,
}

impl InteractiveGeocoder {
    pub fn new(
        endpoint: Url,
        api_key: impl Into<String>,
        cache: Arc<dyn CacheStore<GeocodeResult>>,
        options: InteractiveOptions,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(options.timeout)?,
            endpoint,
            api_key: api_key.into(),
            limiter: Arc::new(RateLimiter::per_second(options.qps)),
            cache,
            options,
        })
    }

    fn is_cached(&self, key: &str) -> bool {
        match self.cache.get(key) {
            Some(hit) => !(self.options.retry_failed && hit.status.is_retryable()),
            None => false,
        }
    }

    /// Geocode every uncached address of `records`, then return the located
    /// records in their original order.
    pub async fn geocode_records(
        &self,
        records: Vec<ProviderRecord>,
    ) -> Result<(Vec<ProviderRecord>, GeocodeSummary)> {
        let mut summary = GeocodeSummary {
            input_rows: records.len(),
            ..Default::default()
        };

        // First full address seen for each key is the one sent to the API
        let mut seen = HashSet::new();
        let mut todo = Vec::new();
        for record in &records {
            let key = record.address_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if self.is_cached(&key) {
                summary.cached += 1;
            } else {
                todo.push((key, record.address_full()));
            }
        }
        summary.unique_addresses = seen.len();

        info!(
            "Unique addresses: {}; to geocode: {}; cached: {}",
            summary.unique_addresses,
            todo.len(),
            summary.cached
        );

        if !todo.is_empty() {
            self.resolve_all(todo, &mut summary).await?;
        }

        let located = rejoin(records, self.cache.as_ref(), &mut summary);
        Ok((located, summary))
    }

    async fn resolve_all(
        &self,
        todo: Vec<(String, String)>,
        summary: &mut GeocodeSummary,
    ) -> Result<()> {
        let total = todo.len();
        let pb = progress::bar(total as u64, "geocoding")?;
        let save_every = self.options.save_every.max(1);

        let mut completed = stream::iter(todo)
            .map(|(key, query)| async move { self.geocode_one(&key, &query).await })
            .buffer_unordered(self.options.workers.max(1));

        let mut done = 0usize;
        while let Some(result) = completed.next().await {
            summary.requested += 1;
            if result.coordinates().is_some() {
                summary.resolved_now += 1;
            } else {
                summary.failed_now += 1;
            }
            self.cache.put(result.qkey.clone(), result);

            done += 1;
            pb.inc(1);
            if done % save_every == 0 {
                flush_blocking(&self.cache).await?;
                debug!("Cache flushed after {} lookups", done);
            }
            if done % 1000 == 0 {
                info!("Geocoded {}/{}", done, total);
            }
        }

        flush_blocking(&self.cache).await?;
        pb.finish_with_message("geocoding complete");
        Ok(())
    }

    /// Resolve one address; never fails, terminal problems become a status.
    pub async fn geocode_one(&self, key: &str, query: &str) -> GeocodeResult {
        let outcome = self
            .options
            .retry
            .run(|attempt| async move {
                self.limiter.acquire().await;
                self.request(key, query, attempt).await
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(Transient::Throttled) => {
                warn!("Giving up on '{}' after repeated throttling", query);
                GeocodeResult::unresolved(key, query, GeocodeStatus::OverQueryLimit)
            }
            Err(Transient::Failed(reason)) => {
                warn!("Giving up on '{}': {}", query, reason);
                GeocodeResult::unresolved(key, query, GeocodeStatus::UnknownError)
            }
        }
    }

    async fn request(
        &self,
        key: &str,
        query: &str,
        attempt: u32,
    ) -> Attempt<GeocodeResult, Transient> {
        let response = match self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("address", query),
                ("key", self.api_key.as_str()),
                ("components", "country:US"),
            ])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("Request for '{}' failed (attempt {}): {}", query, attempt + 1, e);
                return Attempt::Retry(Transient::Failed(e.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retry(Transient::Throttled);
        }
        if status.is_server_error() {
            return Attempt::Retry(Transient::Failed(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Attempt::Done(GeocodeResult::unresolved(
                key,
                query,
                GeocodeStatus::Other(format!("HTTP_{}", status.as_u16())),
            ));
        }

        let body: GeocodeResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => return Attempt::Retry(Transient::Failed(format!("bad response body: {}", e))),
        };

        let status = GeocodeStatus::from(body.status);
        match status {
            GeocodeStatus::OverQueryLimit => Attempt::Retry(Transient::Throttled),
            GeocodeStatus::Ok => match body.results.into_iter().next() {
                Some(hit) => Attempt::Done(GeocodeResult::resolved(
                    key,
                    query,
                    hit.geometry.location.lat,
                    hit.geometry.location.lng,
                    hit.place_id,
                )),
                None => Attempt::Done(GeocodeResult::unresolved(
                    key,
                    query,
                    GeocodeStatus::ZeroResults,
                )),
            },
            other => Attempt::Done(GeocodeResult::unresolved(key, query, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::CountingCache;
    use crate::cache::FileCache;
    use crate::models::provider::sample_record;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body(lat: f64, lng: f64, place_id: &str) -> serde_json::Value {
        json!({
            "status": "OK",
            "results": [{
                "geometry": { "location": { "lat": lat, "lng": lng } },
                "place_id": place_id
            }]
        })
    }

    fn fast_options() -> InteractiveOptions {
        InteractiveOptions {
            qps: 100,
            workers: 4,
            save_every: 1,
            retry: RetryPolicy::new(3, Duration::from_millis(1), 2.0),
            timeout: Duration::from_secs(5),
            retry_failed: false,
        }
    }

    fn geocoder(
        server: &MockServer,
        cache: Arc<FileCache<GeocodeResult>>,
        options: InteractiveOptions,
    ) -> InteractiveGeocoder {
        let endpoint = Url::parse(&format!("{}/geocode/json", server.uri())).unwrap();
        InteractiveGeocoder::new(endpoint, "test-key", cache, options).unwrap()
    }

    #[tokio::test]
    async fn test_ok_and_zero_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geocode/json"))
            .and(query_param("address", "1 A St, Chicago, IL 60601"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(41.5, -87.5, "pa")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/geocode/json"))
            .and(query_param("address", "2 B St, Chicago, IL 60601"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "ZERO_RESULTS", "results": [] })),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let gc = geocoder(&server, cache.clone(), fast_options());

        let records = vec![sample_record("1", "1 A St"), sample_record("2", "2 B St")];
        let (located, summary) = gc.geocode_records(records).await.unwrap();

        assert_eq!(located.len(), 1);
        assert_eq!(located[0].npi, "1");
        assert_eq!(located[0].lat, Some(41.5));
        assert_eq!(located[0].place_id.as_deref(), Some("pa"));
        assert_eq!(summary.requested, 2);
        assert_eq!(summary.resolved_now, 1);
        assert_eq!(summary.dropped.get("ZERO_RESULTS"), Some(&1));

        // Both outcomes are cached, including the negative one
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_flushed_every_save_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geocode/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(41.5, -87.5, "pa")))
            .mount(&server)
            .await;

        let cache = Arc::new(CountingCache::<GeocodeResult>::new());
        let endpoint = Url::parse(&format!("{}/geocode/json", server.uri())).unwrap();
        let options = InteractiveOptions {
            save_every: 2,
            ..fast_options()
        };
        let gc = InteractiveGeocoder::new(endpoint, "test-key", cache.clone(), options).unwrap();

        let records = (1..=5)
            .map(|i| sample_record(&i.to_string(), &format!("{} A St", i)))
            .collect();
        let (located, _) = gc.geocode_records(records).await.unwrap();

        assert_eq!(located.len(), 5);
        // Two periodic flushes, then the final one
        assert_eq!(cache.flushed_at(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_throttling_exhausts_to_over_query_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let gc = geocoder(&server, cache, fast_options());

        let result = gc.geocode_one("1 A ST", "1 A St").await;
        assert_eq!(result.status, GeocodeStatus::OverQueryLimit);
        assert!(result.coordinates().is_none());
    }

    #[tokio::test]
    async fn test_body_throttle_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "OVER_QUERY_LIMIT" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(1.25, 2.5, "p")))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let gc = geocoder(&server, cache, fast_options());

        let result = gc.geocode_one("K", "q").await;
        assert_eq!(result.status, GeocodeStatus::Ok);
        assert_eq!(result.coordinates(), Some((1.25, 2.5)));
    }

    #[tokio::test]
    async fn test_request_denied_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "REQUEST_DENIED" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let gc = geocoder(&server, cache, fast_options());

        let result = gc.geocode_one("K", "q").await;
        assert_eq!(result.status, GeocodeStatus::RequestDenied);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let options = InteractiveOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(1), 2.0),
            timeout: Duration::from_millis(50),
            ..fast_options()
        };
        let gc = geocoder(&server, cache, options);

        let result = gc.geocode_one("K", "q").await;
        assert_eq!(result.status, GeocodeStatus::UnknownError);
    }

    #[tokio::test]
    async fn test_second_run_issues_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("geocode_cache.csv");
        let records = vec![
            sample_record("1", "1 A St"),
            sample_record("2", "2 B St"),
            sample_record("3", "1 A St"),
        ];

        {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(3.0, 4.0, "p")))
                .expect(2)
                .mount(&server)
                .await;
            let cache = Arc::new(FileCache::open(&cache_path).unwrap());
            let gc = geocoder(&server, cache, fast_options());
            let (located, _) = gc.geocode_records(records.clone()).await.unwrap();
            assert_eq!(located.len(), 3);
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(3.0, 4.0, "p")))
            .expect(0)
            .mount(&server)
            .await;
        let cache = Arc::new(FileCache::open(&cache_path).unwrap());
        let gc = geocoder(&server, cache, fast_options());
        let (located, summary) = gc.geocode_records(records).await.unwrap();

        assert_eq!(located.len(), 3);
        assert_eq!(summary.requested, 0);
        assert_eq!(summary.cached, 2);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_requeries_throttled_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(5.0, 6.0, "p")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::open(dir.path().join("g.csv")).unwrap());
        let record = sample_record("1", "1 A St");
        cache.put(
            record.address_key(),
            GeocodeResult::unresolved(
                &record.address_key(),
                &record.address_full(),
                GeocodeStatus::OverQueryLimit,
            ),
        );

        let options = InteractiveOptions {
            retry_failed: true,
            ..fast_options()
        };
        let gc = geocoder(&server, cache, options);
        let (located, summary) = gc.geocode_records(vec![record]).await.unwrap();
        assert_eq!(summary.requested, 1);
        assert_eq!(located[0].lat, Some(5.0));
    }
}
