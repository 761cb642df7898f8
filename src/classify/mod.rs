//! Roster filtering: region allow-list, taxonomy classification and
//! (identifier, address) deduplication.

mod schema;
mod taxonomy;

pub use schema::{SchemaMapping, TaxonomySlot, SWITCH_PREFIX, TAXONOMY_PREFIX};
pub use taxonomy::{Classification, CodeSlot, TaxonomySets};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};
use hashbrown::HashSet;
use std::fmt;
use std::io::Read;
use tracing::{debug, info, warn};

use crate::address::{normalize_region, title_case, zip5};
use crate::models::{EntityType, ProviderRecord, ProviderType};
use crate::records::RecordWriter;

/// Rows per processing chunk
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Counts for one filter run; every input row lands in exactly one of
/// `region_dropped`, `non_matching`, `malformed`, `duplicates` or `kept`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub rows_read: usize,
    pub chunks: usize,
    pub region_dropped: usize,
    pub non_matching: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub kept: usize,
    pub hcbs: usize,
    pub alf: usize,
    pub dual: usize,
}

impl fmt::Display for FilterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {} rows in {} chunks: kept {} (HCBS {}, ALF {}, dual {}), \
             dropped {} by region, {} non-matching, {} malformed, {} duplicates",
            self.rows_read,
            self.chunks,
            self.kept,
            self.hcbs,
            self.alf,
            self.dual,
            self.region_dropped,
            self.non_matching,
            self.malformed,
            self.duplicates
        )
    }
}

enum RowOutcome {
    OutOfRegion,
    NoMatch,
    Matched(Box<ProviderRecord>),
}

/// Streams a raw roster into classified, deduplicated provider records.
pub struct Classifier {
    sets: TaxonomySets,
    regions: Option<HashSet<String>>,
    chunk_size: usize,
}

impl Classifier {
    pub fn new(sets: TaxonomySets) -> Self {
        Self {
            sets,
            regions: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Keep only rows whose practice state is in `regions` (normalized).
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.regions = Some(
            regions
                .into_iter()
                .map(|r| normalize_region(r.as_ref()))
                .filter(|r| !r.is_empty())
                .collect(),
        );
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Classify every row of `input`, writing kept records to `out` in
    /// input order.
    pub fn run<R: Read>(
        &self,
        input: R,
        out: &mut RecordWriter<ProviderRecord>,
    ) -> Result<FilterSummary> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let headers = StringRecord::from_byte_record_lossy(
            reader
                .byte_headers()
                .context("Failed to read roster header")?
                .clone(),
        );
        let schema = SchemaMapping::resolve(&headers)?;

        let mut summary = FilterSummary::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        // Bytes that are not UTF-8 are replaced rather than costing the row
        let mut rows = reader.byte_records();

        loop {
            let mut chunk: Vec<StringRecord> = Vec::with_capacity(self.chunk_size.min(8192));
            let mut taken = 0;
            for row in rows.by_ref().take(self.chunk_size) {
                taken += 1;
                match row {
                    Ok(record) => chunk.push(StringRecord::from_byte_record_lossy(record)),
                    Err(e) => {
                        summary.malformed += 1;
                        warn!("Skipping malformed roster row: {}", e);
                    }
                }
            }
            if taken == 0 {
                break;
            }
            summary.rows_read += taken;
            summary.chunks += 1;

            let kept_before = summary.kept;
            for record in &chunk {
                match self.classify_row(&schema, record) {
                    RowOutcome::OutOfRegion => summary.region_dropped += 1,
                    RowOutcome::NoMatch => summary.non_matching += 1,
                    RowOutcome::Matched(provider) => {
                        let key = (provider.npi.clone(), provider.address_full());
                        if !seen.insert(key) {
                            summary.duplicates += 1;
                            continue;
                        }
                        match provider.provider_type {
                            ProviderType::Hcbs => summary.hcbs += 1,
                            ProviderType::Alf => summary.alf += 1,
                        }
                        if provider.provider_tags.is_dual() {
                            summary.dual += 1;
                        }
                        summary.kept += 1;
                        out.write(&provider)?;
                    }
                }
            }

            info!(
                "Chunk {}: {} rows, {} kept (total read {}, total kept {})",
                summary.chunks,
                taken,
                summary.kept - kept_before,
                summary.rows_read,
                summary.kept
            );
        }

        debug!("Filter summary: {:?}", summary);
        Ok(summary)
    }

    fn classify_row(&self, schema: &SchemaMapping, row: &StringRecord) -> RowOutcome {
        let field = |idx: usize| row.get(idx).unwrap_or("").trim();
        let opt_field = |idx: Option<usize>| idx.map(field).unwrap_or("");

        let state = normalize_region(field(schema.state));
        if let Some(regions) = &self.regions {
            if !regions.contains(&state) {
                return RowOutcome::OutOfRegion;
            }
        }

        let slots: Vec<CodeSlot<'_>> = schema
            .taxonomy
            .iter()
            .map(|slot| CodeSlot {
                code: field(slot.code),
                switch: opt_field(slot.switch),
            })
            .collect();

        let Some(class) = self.sets.classify(&slots) else {
            return RowOutcome::NoMatch;
        };

        // Missing entity column defaults to organization
        let entity_type = EntityType::from_code(opt_field(schema.entity_type));
        let org_name = opt_field(schema.org_name);
        let name = if entity_type == EntityType::Organization && schema.org_name.is_some() {
            org_name.to_string()
        } else {
            format!(
                "{} {}",
                opt_field(schema.first_name),
                opt_field(schema.last_name)
            )
            .trim()
            .to_string()
        };

        RowOutcome::Matched(Box::new(ProviderRecord {
            npi: field(schema.npi).to_string(),
            entity_type,
            provider_type: class.provider_type,
            provider_tags: class.tags,
            org_or_person_name: name,
            address: field(schema.address1).to_string(),
            address2: opt_field(schema.address2).to_string(),
            city: title_case(field(schema.city)),
            state,
            zip: zip5(field(schema.zip)),
            phone: opt_field(schema.phone).to_string(),
            taxonomy_primary: class.primary,
            taxonomy_all: class.all_codes,
            lat: None,
            lon: None,
            geocode_status: None,
            place_id: None,
            county_geoid: None,
            tract_geoid: None,
        }))
    }
}
