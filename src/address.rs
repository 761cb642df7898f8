//! Address normalization helpers.
//!
//! The address key is the join key for the geocode cache, so it must be
//! deterministic across runs and machines.

use regex::Regex;
use std::sync::LazyLock;

static ZIP5: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d{5})").expect("valid regex"));

/// Trim, collapse whitespace runs to a single space, uppercase.
///
/// Idempotent: normalizing an already-normalized key returns it unchanged.
pub fn normalize_address_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Assemble `street[ secondary], city, state zip`.
pub fn assemble_full_address(
    street: &str,
    secondary: &str,
    city: &str,
    state: &str,
    zip: &str,
) -> String {
    let mut full = street.to_string();
    if !secondary.is_empty() {
        full.push(' ');
        full.push_str(secondary);
    }
    format!("{}, {}, {} {}", full, city, state, zip)
        .trim()
        .to_string()
}

/// Leading five digits of a postal code, or the input unchanged if it has none
pub fn zip5(zip: &str) -> String {
    match ZIP5.captures(zip) {
        Some(caps) => caps[1].to_string(),
        None => zip.trim().to_string(),
    }
}

/// Title-case a name, collapsing runs of whitespace. A letter is capitalized
/// when it follows anything other than a letter, so "WINSTON-SALEM" becomes
/// "Winston-Salem" and "O'FALLON" becomes "O'Fallon".
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        let mut after_letter = false;
        for c in word.chars() {
            if after_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            after_letter = c.is_alphabetic();
        }
    }
    out
}

/// Trimmed, upper-cased region code
pub fn normalize_region(state: &str) -> String {
    state.trim().to_uppercase()
}
