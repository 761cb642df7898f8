use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caremap::classify::{Classifier, TaxonomySets, DEFAULT_CHUNK_SIZE};
use caremap::config::Config;
use caremap::geocode::{BatchOptions, Engine, InteractiveOptions};
use caremap::notify::StageNotifier;
use caremap::retry::RetryPolicy;
use caremap::stages::{GeocodeSettings, GeoidSettings, StagePaths, API_KEY_VAR};
use caremap::{Pipeline, Step};

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(about = "Provider roster → HCBS/ALF filter → geocode → GEOIDs → export")]
struct Args {
    /// Stage to run
    #[arg(long, value_enum, default_value = "all")]
    step: Step,

    /// Provider roster CSV (optionally .gz)
    #[arg(long)]
    nppes: Option<PathBuf>,

    /// Comma-separated state codes, or ALL
    #[arg(long, default_value = "IL,WA,MN,CA,FL,AZ,NY,TX")]
    states: String,

    /// Input for the first selected stage, instead of its default
    #[arg(long = "input", alias = "in")]
    input: Option<PathBuf>,

    #[arg(long, default_value = "providers_filtered.csv")]
    out_filtered: PathBuf,

    #[arg(long, default_value = "providers_geocoded_tmp.csv")]
    out_geocoded: PathBuf,

    #[arg(long, default_value = "providers_with_geoids_tmp.csv")]
    out_geoids: PathBuf,

    /// Final export
    #[arg(long, default_value = "providers_8states_geocoded.csv")]
    out: PathBuf,

    /// Geocoding engine
    #[arg(long, value_enum, default_value = "google")]
    engine: Engine,

    /// Interactive requests per second
    #[arg(long, default_value = "10")]
    qps: usize,

    /// Interactive requests in flight
    #[arg(long, default_value = "10")]
    workers: usize,

    /// Flush the geocode cache every N lookups
    #[arg(long, default_value = "2000")]
    save_every: usize,

    /// Addresses per bulk upload
    #[arg(long, default_value = "10000")]
    batch_size: usize,

    /// Attempts per interactive lookup
    #[arg(long, default_value = "5")]
    retries: u32,

    /// Re-query addresses cached as throttled or errored
    #[arg(long)]
    retry_failed: bool,

    /// Roster rows per processing chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[arg(long, default_value = "geocode_cache.csv")]
    geocode_cache: PathBuf,

    #[arg(long, default_value = "geoids_cache.csv")]
    geoids_cache: PathBuf,

    /// TOML file overriding endpoints and taxonomy code sets
    #[arg(long)]
    config: Option<PathBuf>,

    /// Discord webhook URL for stage notifications (optional)
    #[arg(long)]
    discord_webhook: Option<String>,
}

fn parse_states(raw: &str) -> Option<Vec<String>> {
    if raw.trim().eq_ignore_ascii_case("ALL") {
        return None;
    }
    Some(
        raw.split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let reads_roster = args.step.stages().first() == Some(&Step::Filter) && args.input.is_none();
    let nppes = match &args.nppes {
        Some(path) => path.clone(),
        None if reads_roster => anyhow::bail!("--nppes is required for the filter stage"),
        None => PathBuf::new(),
    };

    let mut classifier =
        Classifier::new(TaxonomySets::from_config(&config.taxonomy)).with_chunk_size(args.chunk_size);
    match parse_states(&args.states) {
        Some(states) => {
            info!("Region filter: {}", states.join(","));
            classifier = classifier.with_regions(states);
        }
        None => info!("Region filter: all"),
    }

    let mut geocode = GeocodeSettings::new(args.engine, &config.endpoints, &args.geocode_cache);
    geocode.api_key = std::env::var(API_KEY_VAR).ok();
    geocode.interactive = InteractiveOptions {
        qps: args.qps,
        workers: args.workers,
        save_every: args.save_every,
        retry: RetryPolicy {
            max_attempts: args.retries.max(1),
            ..RetryPolicy::interactive()
        },
        retry_failed: args.retry_failed,
        ..InteractiveOptions::default()
    };
    geocode.batch = BatchOptions {
        batch_size: args.batch_size,
        ..BatchOptions::default()
    };

    let pipeline = Pipeline {
        paths: StagePaths {
            nppes,
            filtered: args.out_filtered.clone(),
            geocoded: args.out_geocoded.clone(),
            geoids: args.out_geoids.clone(),
            out: args.out.clone(),
        },
        classifier,
        geocode,
        geoids: GeoidSettings::new(config.endpoints.census_coordinates.clone(), &args.geoids_cache),
        notifier: StageNotifier::new(args.discord_webhook.clone()),
    };

    info!("Running step '{}'", args.step);
    pipeline.run(args.step, args.input.as_deref()).await?;
    info!("Done");
    Ok(())
}
