//! Core data models for the enrichment pipeline.

pub mod geocode;
pub mod provider;

pub use geocode::{coordinate_key, GeoIdResult, GeocodeResult, GeocodeStatus};
pub use provider::{EntityType, ExportRow, ProviderRecord, ProviderTags, ProviderType, EXPORT_COLUMNS};
