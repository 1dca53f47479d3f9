//! Heuristic type and territory classification over free text.
//!
//! Both checks are substring matches over a normalized text blob. They trade
//! precision for robustness against the loosely structured upstream records.

use serde_json::Value as JsonValue;
use veille_core::{OpportunityType, RawRecord};

use crate::raw::{first_truthy, is_truthy, value_text};

const TYPE_KEYS: [&str; 5] = ["type", "types", "nature", "kinds", "category"];

const TEXT_KEYS: [&str; 6] = [
    "name",
    "title",
    "description",
    "short_description",
    "provider_name",
    "author",
];

const TERRITORY_KEYS: [&str; 3] = ["perimeters", "territories", "location"];

/// Checked before the AAP markers.
const AMI_MARKERS: [&str; 3] = [
    "AMI",
    "MANIFESTATION D'INTÉRÊT",
    "MANIFESTATION D’INTÉRÊT",
];

const AAP_MARKERS: [&str; 3] = ["AAP", "APPEL À PROJETS", "APPEL A PROJETS"];

/// Free-text fields joined with single spaces.
pub fn extract_text_fields(raw: &RawRecord) -> String {
    TEXT_KEYS
        .iter()
        .filter_map(|key| raw.get(*key))
        .filter(|value| is_truthy(value))
        .map(value_text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Category named by the record's markers, whether or not it is accepted.
pub fn detect_marked_type(raw: &RawRecord) -> Option<OpportunityType> {
    let mut parts: Vec<String> = Vec::new();
    for key in TYPE_KEYS {
        match raw.get(key) {
            Some(JsonValue::Array(items)) => {
                parts.extend(items.iter().map(|item| value_text(item).to_uppercase()));
            }
            Some(value) if is_truthy(value) => parts.push(value_text(value).to_uppercase()),
            _ => {}
        }
    }
    parts.push(extract_text_fields(raw).to_uppercase());
    let corpus = parts.join(" ");

    if AMI_MARKERS.iter().any(|marker| corpus.contains(marker)) {
        return Some(OpportunityType::Ami);
    }
    if AAP_MARKERS.iter().any(|marker| corpus.contains(marker)) {
        return Some(OpportunityType::Aap);
    }
    None
}

/// The detected category if accepted. A rejected category is never
/// downgraded to another one.
pub fn detect_type(raw: &RawRecord, accepted: &[OpportunityType]) -> Option<OpportunityType> {
    detect_marked_type(raw).filter(|kind| accepted.contains(kind))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerritoryMatcher {
    code: String,
    aliases: Vec<String>,
}

impl TerritoryMatcher {
    pub fn new(code: &str, aliases: &[String]) -> Self {
        Self {
            code: code.to_lowercase(),
            aliases: aliases.iter().map(|alias| alias.to_lowercase()).collect(),
        }
    }

    pub fn matches(&self, raw: &RawRecord) -> bool {
        let blob = territory_blob(raw);
        blob.contains(&self.code) || self.aliases.iter().any(|alias| blob.contains(alias))
    }
}

/// Lowercased JSON of the geographic fields, or of the whole record when none is set.
fn territory_blob(raw: &RawRecord) -> String {
    let text = match first_truthy(raw, &TERRITORY_KEYS) {
        Some(value) => value.to_string(),
        None => serde_json::to_string(raw).unwrap_or_default(),
    };
    text.to_lowercase()
}
