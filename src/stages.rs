//! The four file-boundary stages and their sequencing.
//!
//! Every stage reads one table and atomically writes another, so any stage
//! can be re-run on its own from the previous stage's output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use url::Url;

use crate::cache::{CacheStore, FileCache};
use crate::classify::{Classifier, FilterSummary};
use crate::config::EndpointConfig;
use crate::error::PipelineError;
use crate::geocode::{
    BatchGeocoder, BatchOptions, Engine, GeocodeSummary, InteractiveGeocoder, InteractiveOptions,
};
use crate::geography::{GeoidSummary, GeographyResolver, DEFAULT_MISS_DELAY, DEFAULT_SAVE_EVERY};
use crate::models::{ExportRow, GeoIdResult, GeocodeResult, ProviderRecord};
use crate::notify::StageNotifier;
use crate::records::{open_input, read_records, write_records, RecordWriter};

pub const API_KEY_VAR: &str = "GOOGLE_MAPS_API_KEY";

/// Stage selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Step {
    Filter,
    Geocode,
    Geoids,
    Export,
    All,
}

impl Step {
    /// Concrete stages this selection runs, in order
    pub fn stages(self) -> &'static [Step] {
        match self {
            Step::Filter => &[Step::Filter],
            Step::Geocode => &[Step::Geocode],
            Step::Geoids => &[Step::Geoids],
            Step::Export => &[Step::Export],
            Step::All => &[Step::Filter, Step::Geocode, Step::Geoids, Step::Export],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Filter => "filter",
            Step::Geocode => "geocode",
            Step::Geoids => "geoids",
            Step::Export => "export",
            Step::All => "all",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: usize,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exported {} rows", self.rows)
    }
}

/// Stage 1: roster → classified, deduplicated provider table
pub fn run_filter(nppes: &Path, out: &Path, classifier: &Classifier) -> Result<FilterSummary> {
    info!("Filtering {} → {}", nppes.display(), out.display());
    let input = open_input(nppes)?;
    let mut writer = RecordWriter::<ProviderRecord>::create(out)?;
    let summary = classifier
        .run(input, &mut writer)
        .with_context(|| format!("Failed to filter {}", nppes.display()))?;
    writer.finish()?;
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct GeocodeSettings {
    pub engine: Engine,
    pub api_key: Option<String>,
    pub google_endpoint: Url,
    pub batch_endpoint: Url,
    pub cache_path: PathBuf,
    pub interactive: InteractiveOptions,
    pub batch: BatchOptions,
}

impl GeocodeSettings {
    pub fn new(engine: Engine, endpoints: &EndpointConfig, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            api_key: None,
            google_endpoint: endpoints.google.clone(),
            batch_endpoint: endpoints.census_batch.clone(),
            cache_path: cache_path.into(),
            interactive: InteractiveOptions::default(),
            batch: BatchOptions::default(),
        }
    }
}

/// Stage 2: attach coordinates; unlocated records are dropped and counted
pub async fn run_geocode(input: &Path, out: &Path, settings: &GeocodeSettings) -> Result<GeocodeSummary> {
    info!(
        "Geocoding {} → {} with {:?} engine (cache {})",
        input.display(),
        out.display(),
        settings.engine,
        settings.cache_path.display()
    );

    // Credentials are checked before any input is read
    let api_key = match settings.engine {
        Engine::Google => Some(
            settings
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or(PipelineError::MissingCredential(API_KEY_VAR))?,
        ),
        Engine::Census => None,
    };

    let records: Vec<ProviderRecord> = read_records(input)?;
    let cache: Arc<FileCache<GeocodeResult>> = Arc::new(FileCache::open(&settings.cache_path)?);
    info!("Loaded {} providers; {} cached addresses", records.len(), cache.len());

    let (located, summary) = match api_key {
        Some(key) => {
            let geocoder = InteractiveGeocoder::new(
                settings.google_endpoint.clone(),
                key,
                cache,
                settings.interactive.clone(),
            )?;
            geocoder.geocode_records(records).await?
        }
        None => {
            let geocoder =
                BatchGeocoder::new(settings.batch_endpoint.clone(), cache, settings.batch.clone())?;
            geocoder.geocode_records(records).await?
        }
    };

    write_records(out, &located)?;
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct GeoidSettings {
    pub endpoint: Url,
    pub cache_path: PathBuf,
    pub save_every: usize,
    pub miss_delay: Duration,
}

impl GeoidSettings {
    pub fn new(endpoint: Url, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            cache_path: cache_path.into(),
            save_every: DEFAULT_SAVE_EVERY,
            miss_delay: DEFAULT_MISS_DELAY,
        }
    }
}

/// Stage 3: attach county and tract identifiers
pub async fn run_geoids(input: &Path, out: &Path, settings: &GeoidSettings) -> Result<GeoidSummary> {
    info!("Tagging geoids {} → {}", input.display(), out.display());
    let records: Vec<ProviderRecord> = read_records(input)?;
    let cache: Arc<FileCache<GeoIdResult>> = Arc::new(FileCache::open(&settings.cache_path)?);

    let resolver = GeographyResolver::new(settings.endpoint.clone(), cache)?
        .with_save_every(settings.save_every)
        .with_miss_delay(settings.miss_delay);
    let (tagged, summary) = resolver.tag_geoids(records).await?;

    write_records(out, &tagged)?;
    Ok(summary)
}

/// Stage 4: project to the fixed downstream column order
pub fn run_export(input: &Path, out: &Path) -> Result<ExportSummary> {
    info!("Exporting {} → {}", input.display(), out.display());
    let records: Vec<ProviderRecord> = read_records(input)?;
    let rows: Vec<ExportRow> = records.into_iter().map(ExportRow::from).collect();
    let rows = write_records(out, &rows)?;
    Ok(ExportSummary { rows })
}

/// Default file locations for each stage boundary
#[derive(Debug, Clone)]
pub struct StagePaths {
    pub nppes: PathBuf,
    pub filtered: PathBuf,
    pub geocoded: PathBuf,
    pub geoids: PathBuf,
    pub out: PathBuf,
}

impl StagePaths {
    fn io(&self, stage: Step) -> (&Path, &Path) {
        match stage {
            Step::Filter => (&self.nppes, &self.filtered),
            Step::Geocode => (&self.filtered, &self.geocoded),
            Step::Geoids => (&self.geocoded, &self.geoids),
            Step::Export | Step::All => (&self.geoids, &self.out),
        }
    }
}

/// Everything a stage sequence needs
pub struct Pipeline {
    pub paths: StagePaths,
    pub classifier: Classifier,
    pub geocode: GeocodeSettings,
    pub geoids: GeoidSettings,
    pub notifier: StageNotifier,
}

impl Pipeline {
    /// Run the selected stages in order. `input` replaces the first stage's
    /// input; later stages read the previous stage's output.
    pub async fn run(&self, step: Step, input: Option<&Path>) -> Result<()> {
        for (i, &stage) in step.stages().iter().enumerate() {
            let (default_in, out) = self.paths.io(stage);
            let input = match input {
                Some(path) if i == 0 => path,
                _ => default_in,
            };

            match self.run_stage(stage, input, out).await {
                Ok(summary) => {
                    info!("[{}] {}", stage, summary);
                    self.notifier.finished(stage.name(), &summary).await;
                }
                Err(e) => {
                    self.notifier.failed(stage.name(), &e).await;
                    return Err(e.context(format!("{} stage failed", stage)));
                }
            }
        }
        Ok(())
    }

    async fn run_stage(&self, stage: Step, input: &Path, out: &Path) -> Result<String> {
        let summary = match stage {
            Step::Filter => run_filter(input, out, &self.classifier)?.to_string(),
            Step::Geocode => run_geocode(input, out, &self.geocode).await?.to_string(),
            Step::Geoids => run_geoids(input, out, &self.geoids).await?.to_string(),
            Step::Export => run_export(input, out)?.to_string(),
            Step::All => anyhow::bail!("`all` is not a concrete stage"),
        };
        Ok(summary)
    }
}
