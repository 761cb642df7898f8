use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use url::Url;

use crate::error::PipelineError;

pub const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const CENSUS_BATCH_URL: &str =
    "https://geocoding.geo.census.gov/geocoder/geographies/addressbatch";
pub const CENSUS_COORDINATES_URL: &str =
    "https://geocoding.geo.census.gov/geocoder/geographies/coordinates";

/// Home-care / home- and community-based services taxonomy codes
pub const DEFAULT_HCBS_CODES: [&str; 4] = ["253Z00000X", "3747P1801X", "376J00000X", "251E00000X"];
/// Assisted-living taxonomy codes
pub const DEFAULT_ALF_CODES: [&str; 3] = ["310400000X", "3104A0625X", "3104A0630X"];

/// Optional file-based configuration; every section falls back to defaults.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub endpoints: EndpointConfig,
    pub taxonomy: TaxonomyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointConfig {
    pub google: Url,
    pub census_batch: Url,
    pub census_coordinates: Url,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            google: static_url(GOOGLE_GEOCODE_URL),
            census_batch: static_url(CENSUS_BATCH_URL),
            census_coordinates: static_url(CENSUS_COORDINATES_URL),
        }
    }
}

fn static_url(s: &str) -> Url {
    Url::parse(s).expect("built-in endpoint URL is valid")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TaxonomyConfig {
    pub hcbs: Vec<String>,
    pub alf: Vec<String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            hcbs: DEFAULT_HCBS_CODES.iter().map(|c| c.to_string()).collect(),
            alf: DEFAULT_ALF_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.taxonomy.hcbs.is_empty() || self.taxonomy.alf.is_empty() {
            return Err(PipelineError::config(
                "taxonomy.hcbs and taxonomy.alf must each list at least one code",
            ));
        }
        if let Some(shared) = self
            .taxonomy
            .hcbs
            .iter()
            .find(|code| self.taxonomy.alf.contains(code))
        {
            return Err(PipelineError::config(format!(
                "taxonomy code {} is listed under both hcbs and alf",
                shared
            )));
        }
        Ok(())
    }
}
