//! Fatal pipeline errors.
//!
//! Per-record outcomes (an address that does not geocode, a coordinate with
//! no tract) are never errors; they are recorded as empty results and
//! counted in stage summaries.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A required logical column has no matching header in the roster.
    #[error("missing required column '{field}' (looked for: {})", .candidates.join(", "))]
    MissingColumn {
        field: &'static str,
        candidates: Vec<&'static str>,
    },

    /// The roster has no taxonomy code columns at all.
    #[error("no taxonomy code columns found (expected headers containing '{prefix}')")]
    NoTaxonomyColumns { prefix: &'static str },

    /// A credential required by the selected engine is not set.
    #[error("missing credential: set the {0} environment variable")]
    MissingCredential(&'static str),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Reading or writing a cache table failed.
    #[error("cache I/O error at {path:?}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A cache table exists but cannot be parsed.
    #[error("cache at {path:?} is malformed: {source}")]
    CacheFormat {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
