//! Core domain model and provenance types for the veille collector.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "veille-core";

/// Issuer recorded when the upstream record names none.
pub const UNKNOWN_ISSUER: &str = "Inconnu";

/// Untyped upstream record. Nothing about its shape is guaranteed.
pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpportunityType {
    /// Appel à projets.
    #[serde(rename = "AAP")]
    Aap,
    /// Appel à manifestation d'intérêt.
    #[serde(rename = "AMI")]
    Ami,
}

impl OpportunityType {
    pub const ALL: [OpportunityType; 2] = [OpportunityType::Aap, OpportunityType::Ami];

    pub fn code(self) -> &'static str {
        match self {
            OpportunityType::Aap => "AAP",
            OpportunityType::Ami => "AMI",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for OpportunityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Null, `false`, zero, and empty strings/arrays/objects count as absent.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// Canonical persisted opportunity. Field names are a downstream contract.
///
/// Entries written by hand or by older collectors may lack the identifier
/// or the timestamps; they load with those fields empty rather than failing.
/// Timestamps are re-emitted in chrono's RFC 3339 form (`Z` suffix), so an
/// entry stored as `+00:00` keeps its instant but not its exact text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default = "unknown_issuer")]
    pub issuer: String,
    pub deadline: Option<String>,
    pub calendar: Option<JsonValue>,
    pub url: Option<String>,
    #[serde(default)]
    pub description: String,
    pub territory: Option<JsonValue>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    pub amount: Option<JsonValue>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_last_checked_at: Option<DateTime<Utc>>,
    /// Missing sorts before any instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_at: Option<DateTime<Utc>>,
    /// Keys written by other tools into the snapshot; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn unknown_issuer() -> String {
    UNKNOWN_ISSUER.to_string()
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s)),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, found {other}"
        ))),
    }
}

/// Provenance entry written under `_meta.sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProvenance {
    pub name: String,
    pub attribution_text: String,
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceProvenance>,
}

/// The whole persisted document. Replaced, never appended, on each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_meta")]
    pub meta: SnapshotMeta,
    pub opportunities: Vec<Opportunity>,
}

/// Source of "now" for stamping and freshness cutoffs.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant; used by tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
