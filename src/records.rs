//! Stage file I/O: gzip-aware input, header-checked reads, and atomic
//! tabular writes.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::models::{ExportRow, ProviderRecord, EXPORT_COLUMNS};

/// A row type with a fixed header
pub trait Tabular: Serialize + DeserializeOwned {
    const COLUMNS: &'static [&'static str];
}

/// Intermediate stage files carry every column, enrichment fields last
pub const RECORD_COLUMNS: [&str; 19] = [
    "npi",
    "entity_type",
    "provider_type",
    "provider_tags",
    "org_or_person_name",
    "address",
    "address2",
    "city",
    "state",
    "zip",
    "phone",
    "taxonomy_primary",
    "taxonomy_all",
    "lat",
    "lon",
    "geocode_status",
    "place_id",
    "county_geoid",
    "tract_geoid",
];

impl Tabular for ProviderRecord {
    const COLUMNS: &'static [&'static str] = &RECORD_COLUMNS;
}

impl Tabular for ExportRow {
    const COLUMNS: &'static [&'static str] = &EXPORT_COLUMNS;
}

/// Open a possibly gzip-compressed input file (by `.gz` extension)
pub fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input file {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().map_or(false, |e| e == "gz") {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(reader)
}

/// Read every row of a stage file
pub fn read_records<T: Tabular>(path: &Path) -> Result<Vec<T>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(open_input(path)?);

    let mut rows = Vec::new();
    for (i, row) in reader.deserialize::<T>().enumerate() {
        // +2: header line plus one-based numbering
        let row = row.with_context(|| format!("{}: malformed row {}", path.display(), i + 2))?;
        rows.push(row);
    }
    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Writes rows to a temporary file and moves it over `path` on `finish`.
///
/// The header is always written, so a stage that keeps nothing still leaves
/// a well-formed empty table behind.
pub struct RecordWriter<T: Tabular> {
    path: PathBuf,
    writer: csv::Writer<NamedTempFile>,
    written: usize,
    _row: PhantomData<T>,
}

impl<T: Tabular> RecordWriter<T> {
    pub fn create(path: &Path) -> Result<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        let tmp = NamedTempFile::new_in(&dir).context("Failed to create temporary output file")?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(tmp);
        writer.write_record(T::COLUMNS)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            written: 0,
            _row: PhantomData,
        })
    }

    pub fn write(&mut self, row: &T) -> Result<()> {
        self.writer.serialize(row)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and atomically replace the destination; returns the row count
    pub fn finish(self) -> Result<usize> {
        let tmp = self
            .writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush output: {}", e.error()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(self.written)
    }
}

/// Write all rows to `path` in one go
pub fn write_records<'a, T, I>(path: &Path, rows: I) -> Result<usize>
where
    T: Tabular + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut writer = RecordWriter::create(path)?;
    for row in rows {
        writer.write(row)?;
    }
    writer.finish()
}
