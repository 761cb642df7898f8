//! Roster column mapping, resolved once from the header row.

use csv::StringRecord;
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::error::PipelineError;

pub const TAXONOMY_PREFIX: &str = "Healthcare Provider Taxonomy Code_";
pub const SWITCH_PREFIX: &str = "Healthcare Provider Primary Taxonomy Switch_";

const NPI: &[&str] = &["NPI"];
const ENTITY_TYPE: &[&str] = &["Entity Type Code", "Entity Type"];
const ORG_NAME: &[&str] = &[
    "Provider Organization Name (Legal Business Name)",
    "Organization Name",
];
const LAST_NAME: &[&str] = &["Provider Last Name (Legal Name)", "Last Name"];
const FIRST_NAME: &[&str] = &["Provider First Name", "First Name"];
const ADDRESS1: &[&str] = &[
    "Provider First Line Business Practice Location Address",
    "Practice Address Line 1",
];
const ADDRESS2: &[&str] = &[
    "Provider Second Line Business Practice Location Address",
    "Practice Address Line 2",
];
const CITY: &[&str] = &[
    "Provider Business Practice Location Address City Name",
    "Practice City",
];
const STATE: &[&str] = &[
    "Provider Business Practice Location Address State Name",
    "Practice State",
];
const ZIP: &[&str] = &[
    "Provider Business Practice Location Address Postal Code",
    "Practice Postal Code",
];
const PHONE: &[&str] = &[
    "Provider Business Practice Location Address Telephone Number",
    "Practice Phone",
];

/// One taxonomy slot and its primary-switch companion, if present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxonomySlot {
    pub code: usize,
    pub switch: Option<usize>,
}

/// Column indices for every logical roster field
#[derive(Debug, Clone)]
pub struct SchemaMapping {
    pub npi: usize,
    pub entity_type: Option<usize>,
    pub org_name: Option<usize>,
    pub last_name: Option<usize>,
    pub first_name: Option<usize>,
    pub address1: usize,
    pub address2: Option<usize>,
    pub city: usize,
    pub state: usize,
    pub zip: usize,
    pub phone: Option<usize>,
    pub taxonomy: Vec<TaxonomySlot>,
}

fn find(headers: &StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|cand| headers.iter().position(|h| h.trim() == *cand))
}

fn require(
    headers: &StringRecord,
    field: &'static str,
    candidates: &'static [&'static str],
) -> Result<usize, PipelineError> {
    find(headers, candidates).ok_or_else(|| PipelineError::MissingColumn {
        field,
        candidates: candidates.to_vec(),
    })
}

impl SchemaMapping {
    /// Resolve the mapping, failing on the first required field with no match.
    pub fn resolve(headers: &StringRecord) -> Result<Self, PipelineError> {
        // Switch columns are paired with code columns by their numeric suffix
        let switches: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                h.trim()
                    .split_once(SWITCH_PREFIX)
                    .map(|(_, suffix)| (suffix, i))
            })
            .collect();

        let taxonomy: Vec<TaxonomySlot> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                h.trim()
                    .split_once(TAXONOMY_PREFIX)
                    .map(|(_, suffix)| TaxonomySlot {
                        code: i,
                        switch: switches.get(suffix).copied(),
                    })
            })
            .collect();

        if taxonomy.is_empty() {
            return Err(PipelineError::NoTaxonomyColumns {
                prefix: TAXONOMY_PREFIX,
            });
        }

        let mapping = Self {
            npi: require(headers, "npi", NPI)?,
            entity_type: find(headers, ENTITY_TYPE),
            org_name: find(headers, ORG_NAME),
            last_name: find(headers, LAST_NAME),
            first_name: find(headers, FIRST_NAME),
            address1: require(headers, "address", ADDRESS1)?,
            address2: find(headers, ADDRESS2),
            city: require(headers, "city", CITY)?,
            state: require(headers, "state", STATE)?,
            zip: require(headers, "zip", ZIP)?,
            phone: find(headers, PHONE),
            taxonomy,
        };

        info!(
            "Resolved roster schema: {} taxonomy columns, {} switch columns",
            mapping.taxonomy.len(),
            mapping.taxonomy.iter().filter(|s| s.switch.is_some()).count()
        );
        debug!("Schema mapping: {:?}", mapping);
        Ok(mapping)
    }
}
