//! Lookups over untyped upstream records.

use serde_json::Value as JsonValue;
pub use veille_core::is_truthy;
use veille_core::RawRecord;

/// Value of the first key holding a truthy value.
pub fn first_truthy<'a>(raw: &'a RawRecord, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| is_truthy(value))
}

/// Plain text for a scalar; compact JSON for anything structured.
pub fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn first_truthy_text(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    first_truthy(raw, keys).map(value_text)
}
