//! Taxonomy code sets and per-row classification.

use hashbrown::HashSet;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::config::TaxonomyConfig;
use crate::models::{ProviderTags, ProviderType};

static TAXONOMY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Z]{10}$").expect("valid regex"));

/// One slot's code and primary switch value, as read from the roster
#[derive(Debug, Clone, Copy)]
pub struct CodeSlot<'a> {
    pub code: &'a str,
    pub switch: &'a str,
}

/// Outcome for a row with at least one matching slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub primary: String,
    pub provider_type: ProviderType,
    pub tags: ProviderTags,
    /// Sorted unique non-empty codes from every slot
    pub all_codes: String,
}

/// The two target domains
#[derive(Debug, Clone)]
pub struct TaxonomySets {
    hcbs: HashSet<String>,
    alf: HashSet<String>,
}

impl TaxonomySets {
    pub fn new<I, J>(hcbs: I, alf: J) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        J: IntoIterator,
        J::Item: Into<String>,
    {
        Self {
            hcbs: hcbs.into_iter().map(Into::into).collect(),
            alf: alf.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &TaxonomyConfig) -> Self {
        let normalize = |codes: &[String]| -> Vec<String> {
            codes.iter().map(|c| c.trim().to_uppercase()).collect()
        };
        Self::new(normalize(&config.hcbs), normalize(&config.alf))
    }

    fn domain_of(&self, code: &str) -> (bool, bool) {
        if !TAXONOMY_CODE.is_match(code) {
            return (false, false);
        }
        (self.hcbs.contains(code), self.alf.contains(code))
    }

    /// Classify a row from its taxonomy slots; `None` if no slot matches.
    ///
    /// The primary code is the first matching slot flagged `Y`, or the first
    /// matching slot when none is flagged.
    pub fn classify(&self, slots: &[CodeSlot<'_>]) -> Option<Classification> {
        let mut tags = ProviderTags::default();
        let mut first_match: Option<&str> = None;
        let mut flagged: Option<&str> = None;

        for slot in slots {
            let code = slot.code.trim();
            let (is_hcbs, is_alf) = self.domain_of(code);
            if !is_hcbs && !is_alf {
                continue;
            }
            tags.hcbs |= is_hcbs;
            tags.alf |= is_alf;
            first_match.get_or_insert(code);
            if flagged.is_none() && slot.switch.trim().eq_ignore_ascii_case("Y") {
                flagged = Some(code);
            }
        }

        let primary = flagged.or(first_match)?;
        let provider_type = if self.alf.contains(primary) {
            ProviderType::Alf
        } else {
            ProviderType::Hcbs
        };

        let all_codes = slots
            .iter()
            .map(|s| s.code.trim())
            .filter(|c| !c.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(";");

        Some(Classification {
            primary: primary.to_string(),
            provider_type,
            tags,
            all_codes,
        })
    }
}

impl Default for TaxonomySets {
    fn default() -> Self {
        Self::from_config(&TaxonomyConfig::default())
    }
}
