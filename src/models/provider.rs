//! Provider record carried through every pipeline stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::address::{assemble_full_address, normalize_address_key};

/// Service domain a provider is classified under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    /// Home- and community-based services
    #[serde(rename = "HCBS")]
    Hcbs,
    /// Assisted living facility
    #[serde(rename = "ALF")]
    Alf,
}

impl ProviderType {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderType::Hcbs => "HCBS",
            ProviderType::Alf => "ALF",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// NPPES entity type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "1")]
    Individual,
    #[serde(rename = "2")]
    Organization,
}

impl EntityType {
    /// Anything other than an explicit `1` is treated as an organization.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "1" => EntityType::Individual,
            _ => EntityType::Organization,
        }
    }
}

/// Which domain code sets a row matched on any of its taxonomy slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderTags {
    pub hcbs: bool,
    pub alf: bool,
}

impl ProviderTags {
    pub fn is_dual(&self) -> bool {
        self.hcbs && self.alf
    }

    pub fn is_empty(&self) -> bool {
        !self.hcbs && !self.alf
    }
}

impl fmt::Display for ProviderTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.hcbs, self.alf) {
            (true, true) => f.write_str("HCBS;ALF"),
            (true, false) => f.write_str("HCBS"),
            (false, true) => f.write_str("ALF"),
            (false, false) => Ok(()),
        }
    }
}

impl FromStr for ProviderTags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = ProviderTags::default();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "HCBS" => tags.hcbs = true,
                "ALF" => tags.alf = true,
                other => return Err(format!("unknown provider tag '{}'", other)),
            }
        }
        Ok(tags)
    }
}

impl TryFrom<String> for ProviderTags {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderTags> for String {
    fn from(tags: ProviderTags) -> Self {
        tags.to_string()
    }
}

/// One filtered provider location.
///
/// The identity and address fields are fixed once the classifier emits the
/// record; later stages only fill in the enrichment fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub npi: String,
    pub entity_type: EntityType,
    pub provider_type: ProviderType,
    pub provider_tags: ProviderTags,
    pub org_or_person_name: String,
    pub address: String,
    #[serde(default)]
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(default)]
    pub phone: String,
    pub taxonomy_primary: String,
    #[serde(default)]
    pub taxonomy_all: String,

    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub geocode_status: Option<String>,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub county_geoid: Option<String>,
    #[serde(default)]
    pub tract_geoid: Option<String>,
}

impl ProviderRecord {
    /// `address[ address2], city, state zip`
    pub fn address_full(&self) -> String {
        assemble_full_address(
            &self.address,
            &self.address2,
            &self.city,
            &self.state,
            &self.zip,
        )
    }

    pub fn address_key(&self) -> String {
        normalize_address_key(&self.address_full())
    }

    /// Street line as submitted to the bulk geocoder
    pub fn street(&self) -> String {
        format!("{} {}", self.address, self.address2).trim().to_string()
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn has_geoids(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.county_geoid) && filled(&self.tract_geoid)
    }
}

/// Final export row in the fixed downstream column order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRow {
    pub npi: String,
    pub entity_type: EntityType,
    pub provider_type: ProviderType,
    pub provider_tags: ProviderTags,
    pub org_or_person_name: String,
    pub address: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub phone: String,
    pub taxonomy_primary: String,
    pub taxonomy_all: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub county_geoid: String,
    pub tract_geoid: String,
}

impl From<ProviderRecord> for ExportRow {
    fn from(record: ProviderRecord) -> Self {
        Self {
            npi: record.npi,
            entity_type: record.entity_type,
            provider_type: record.provider_type,
            provider_tags: record.provider_tags,
            org_or_person_name: record.org_or_person_name,
            address: record.address,
            address2: record.address2,
            city: record.city,
            state: record.state,
            zip: record.zip,
            phone: record.phone,
            taxonomy_primary: record.taxonomy_primary,
            taxonomy_all: record.taxonomy_all,
            lat: record.lat,
            lon: record.lon,
            county_geoid: record.county_geoid.unwrap_or_default(),
            tract_geoid: record.tract_geoid.unwrap_or_default(),
        }
    }
}

/// Export header, in order
pub const EXPORT_COLUMNS: [&str; 17] = [
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
    "county_geoid",
    "tract_geoid",
];

#[cfg(test)]
pub(crate) fn sample_record(npi: &str, address: &str) -> ProviderRecord {
    ProviderRecord {
        npi: npi.to_string(),
        entity_type: EntityType::Organization,
        provider_type: ProviderType::Hcbs,
        provider_tags: ProviderTags {
            hcbs: true,
            alf: false,
        },
        org_or_person_name: "Sunrise Home Care".to_string(),
        address: address.to_string(),
        address2: String::new(),
        city: "Chicago".to_string(),
        state: "IL".to_string(),
        zip: "60601".to_string(),
        phone: "3125550100".to_string(),
        taxonomy_primary: "253Z00000X".to_string(),
        taxonomy_all: "253Z00000X".to_string(),
        lat: None,
        lon: None,
        geocode_status: None,
        place_id: None,
        county_geoid: None,
        tract_geoid: None,
    }
}
