//! caremap - provider roster enrichment pipeline
//!
//! Filters a national provider roster down to home- and community-based
//! services and assisted-living providers, geocodes their practice
//! addresses, tags county and census tract identifiers, and exports a flat
//! table for map tooling.

pub mod address;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod geocode;
pub mod geography;
pub mod models;
pub mod notify;
pub mod progress;
pub mod ratelimit;
pub mod records;
pub mod retry;
pub mod stages;

pub use error::PipelineError;
pub use models::{ExportRow, ProviderRecord};
pub use stages::{Pipeline, Step};
