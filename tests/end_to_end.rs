use std::fs;
use std::time::Duration;

use caremap::classify::{Classifier, TaxonomySets};
use caremap::config::EndpointConfig;
use caremap::geocode::{Engine, InteractiveOptions};
use caremap::models::{ProviderRecord, EXPORT_COLUMNS};
use caremap::notify::StageNotifier;
use caremap::records::read_records;
use caremap::retry::RetryPolicy;
use caremap::stages::{GeocodeSettings, GeoidSettings, StagePaths};
use caremap::{ExportRow, Pipeline, Step};
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROSTER: &str = "\
NPI,Entity Type Code,Provider Organization Name (Legal Business Name),Provider Last Name (Legal Name),Provider First Name,Provider First Line Business Practice Location Address,Provider Second Line Business Practice Location Address,Provider Business Practice Location Address City Name,Provider Business Practice Location Address State Name,Provider Business Practice Location Address Postal Code,Provider Business Practice Location Address Telephone Number,Healthcare Provider Taxonomy Code_1,Healthcare Provider Primary Taxonomy Switch_1,Healthcare Provider Taxonomy Code_2,Healthcare Provider Primary Taxonomy Switch_2
1000000001,2,Sunrise Home Care,,,100 Main St,,CHICAGO,il,606011234,3125550100,253Z00000X,Y,,
1000000002,1,,Doe,Jane,200 Oak Ave,Suite 5,SEATTLE,WA,98101,,207Q00000X,N,310400000X,Y
1000000003,2,Lone Star Care,,,300 Elm St,,AUSTIN,TX,78701,,253Z00000X,Y,,
1000000004,2,Lakeview Clinic,,,400 Lake St,,EVANSTON,IL,60201,,207Q00000X,Y,,
";

async fn mock_apis() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .and(query_param("address", "100 Main St, Chicago, IL 60601"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "OK",
            "results": [{
                "geometry": { "location": { "lat": 41.882, "lng": -87.623 } },
                "place_id": "place-1"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .and(query_param("address", "200 Oak Ave Suite 5, Seattle, WA 98101"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "status": "ZERO_RESULTS", "results": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/coordinates"))
        .and(query_param("vintage", "Current_Current"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "geographies": {
                "Counties": [{ "GEOID": "17031" }],
                "Census Tracts": [{ "GEOID": "17031081403" }]
            }}
        })))
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn test_roster_through_all_stages() {
    let server = mock_apis().await;
    let dir = tempfile::tempdir().unwrap();
    let file = |name: &str| dir.path().join(name);
    fs::write(file("nppes.csv"), ROSTER).unwrap();

    let endpoints = EndpointConfig {
        google: Url::parse(&format!("{}/geocode/json", server.uri())).unwrap(),
        census_batch: Url::parse(&format!("{}/addressbatch", server.uri())).unwrap(),
        census_coordinates: Url::parse(&format!("{}/coordinates", server.uri())).unwrap(),
    };

    let mut geocode = GeocodeSettings::new(Engine::Google, &endpoints, file("geocode_cache.csv"));
    geocode.api_key = Some("test-key".into());
    geocode.interactive = InteractiveOptions {
        retry: RetryPolicy::new(2, Duration::from_millis(1), 2.0),
        ..InteractiveOptions::default()
    };
    let mut geoids = GeoidSettings::new(endpoints.census_coordinates.clone(), file("geoids_cache.csv"));
    geoids.miss_delay = Duration::ZERO;

    let paths = StagePaths {
        nppes: file("nppes.csv"),
        filtered: file("filtered.csv"),
        geocoded: file("geocoded.csv"),
        geoids: file("geoids.csv"),
        out: file("final.csv"),
    };
    let pipeline = Pipeline {
        paths: paths.clone(),
        classifier: Classifier::new(TaxonomySets::default()).with_regions(["IL", "WA"]),
        geocode,
        geoids,
        notifier: StageNotifier::default(),
    };

    pipeline.run(Step::All, None).await.unwrap();

    let filtered: Vec<ProviderRecord> = read_records(&paths.filtered).unwrap();
    assert_eq!(filtered.len(), 2);
    assert_eq!(filtered[1].org_or_person_name, "Jane Doe");
    assert_eq!(filtered[1].taxonomy_primary, "310400000X");

    let geocoded: Vec<ProviderRecord> = read_records(&paths.geocoded).unwrap();
    assert_eq!(geocoded.len(), 1);
    assert_eq!(geocoded[0].geocode_status.as_deref(), Some("OK"));

    let tagged: Vec<ProviderRecord> = read_records(&paths.geoids).unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].county_geoid.as_deref(), Some("17031"));

    let text = fs::read_to_string(&paths.out).unwrap();
    assert_eq!(text.lines().next().unwrap(), EXPORT_COLUMNS.join(","));

    let exported: Vec<ExportRow> = read_records(&paths.out).unwrap();
    assert_eq!(exported.len(), 1);
    let row = &exported[0];
    assert_eq!(row.npi, "1000000001");
    assert_eq!(row.city, "Chicago");
    assert_eq!(row.zip, "60601");
    assert_eq!(row.lat, Some(41.882));
    assert_eq!(row.lon, Some(-87.623));
    assert_eq!(row.county_geoid, "17031");
    assert_eq!(row.tract_geoid, "17031081403");

    // Both outcomes were cached, the negative one included
    let cached = fs::read_to_string(file("geocode_cache.csv")).unwrap();
    assert_eq!(cached.lines().count(), 3);
}

#[tokio::test]
async fn test_rerun_from_intermediate_file() {
    let server = mock_apis().await;
    let dir = tempfile::tempdir().unwrap();
    let file = |name: &str| dir.path().join(name);
    fs::write(file("nppes.csv"), ROSTER).unwrap();

    let classifier = Classifier::new(TaxonomySets::default()).with_regions(["IL", "WA"]);
    let summary = caremap::stages::run_filter(&file("nppes.csv"), &file("filtered.csv"), &classifier).unwrap();
    assert_eq!(summary.rows_read, 4);
    assert_eq!(summary.kept, 2);
    assert_eq!(summary.region_dropped, 1);
    assert_eq!(summary.non_matching, 1);

    let endpoints = EndpointConfig {
        google: Url::parse(&format!("{}/geocode/json", server.uri())).unwrap(),
        ..EndpointConfig::default()
    };
    let mut settings = GeocodeSettings::new(Engine::Google, &endpoints, file("cache.csv"));
    settings.api_key = Some("k".into());

    let first = caremap::stages::run_geocode(&file("filtered.csv"), &file("geocoded.csv"), &settings)
        .await
        .unwrap();
    assert_eq!(first.requested, 2);
    assert_eq!(first.output_rows, 1);
    assert_eq!(first.dropped.get("ZERO_RESULTS"), Some(&1));

    // Resume: nothing new to request, same output
    let second = caremap::stages::run_geocode(&file("filtered.csv"), &file("geocoded.csv"), &settings)
        .await
        .unwrap();
    assert_eq!(second.requested, 0);
    assert_eq!(second.cached, 2);
    assert_eq!(second.output_rows, 1);
}
