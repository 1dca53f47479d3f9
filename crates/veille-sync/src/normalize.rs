//! Raw upstream record -> canonical `Opportunity`.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde_json::Value as JsonValue;
use veille_core::{Opportunity, OpportunityType, RawRecord, UNKNOWN_ISSUER};

use crate::classify::detect_type;
use crate::raw::{first_truthy, first_truthy_text, value_text};

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("static date pattern"));

/// First `YYYY-MM-DD` substring. Matches the shape only; `2025-13-45` passes.
pub fn extract_iso_date(text: &str) -> Option<String> {
    ISO_DATE.find(text).map(|m| m.as_str().to_string())
}

/// Midnight UTC of the first embedded calendar-valid date.
pub fn parse_day_start(text: &str) -> Option<DateTime<Utc>> {
    let day = extract_iso_date(text)?;
    let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    accepted_types: Vec<OpportunityType>,
    detail_url_base: String,
    source_name: String,
}

impl Normalizer {
    pub fn new(
        accepted_types: Vec<OpportunityType>,
        detail_url_base: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            accepted_types,
            detail_url_base: detail_url_base.into(),
            source_name: source_name.into(),
        }
    }

    /// `None` when the record has no usable title or no accepted type. Every
    /// other field degrades to its default.
    pub fn normalize(&self, raw: &RawRecord, now: DateTime<Utc>) -> Option<Opportunity> {
        let title = first_truthy_text(raw, &["name", "title"])?.trim().to_string();
        if title.is_empty() {
            return None;
        }

        let kind = detect_type(raw, &self.accepted_types)?;

        let raw_id = first_truthy(raw, &["id"]).map(value_text);
        let url = first_truthy_text(raw, &["url", "external_url", "source_url"]).or_else(|| {
            raw_id
                .as_ref()
                .map(|id| format!("{}{}", self.detail_url_base, id))
        });

        let deadline = first_truthy_text(raw, &["date_submission_deadline", "deadline", "closing_date"])
            .and_then(|text| extract_iso_date(&text));

        let issuer = first_truthy_text(raw, &["provider_name", "issuer"])
            .unwrap_or_else(|| UNKNOWN_ISSUER.to_string())
            .trim()
            .to_string();

        let description = first_truthy_text(raw, &["description", "short_description"])
            .unwrap_or_default()
            .trim()
            .to_string();

        Some(Opportunity {
            id: raw_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            title,
            issuer,
            deadline,
            calendar: first_truthy(raw, &["calendar", "period"]).cloned(),
            url,
            description,
            territory: first_truthy(raw, &["perimeters", "territories"]).cloned(),
            tags: tags_from(first_truthy(raw, &["tags", "categories"])),
            kind,
            amount: first_truthy(raw, &["amount", "financial_amount"]).cloned(),
            source: self.source_name.clone(),
            source_last_checked_at: Some(now),
            discovered_at: Some(now),
            extra: Default::default(),
        })
    }
}

fn tags_from(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items.iter().map(value_text).collect(),
        Some(JsonValue::String(tag)) => vec![tag.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DETAIL_BASE: &str = "https://aides-territoires.beta.gouv.fr/aides/";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 6, 0, 0).single().unwrap()
    }

    fn normalizer(types: &[OpportunityType]) -> Normalizer {
        Normalizer::new(types.to_vec(), DETAIL_BASE, "Aides-territoires API")
    }

    fn record(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn youth_call() -> RawRecord {
        record(json!({
            "name": "Appel à projets jeunesse",
            "id": "42",
            "date_submission_deadline": "Candidatures avant le 2025-03-01",
            "perimeters": "La Réunion"
        }))
    }

    #[test]
    fn youth_call_normalizes_with_synthesized_url() {
        let opp = normalizer(&[OpportunityType::Aap])
            .normalize(&youth_call(), now())
            .expect("accepted");
        assert_eq!(opp.title, "Appel à projets jeunesse");
        assert_eq!(opp.kind, OpportunityType::Aap);
        assert_eq!(opp.deadline.as_deref(), Some("2025-03-01"));
        assert_eq!(
            opp.url.as_deref(),
            Some("https://aides-territoires.beta.gouv.fr/aides/42")
        );
        assert_eq!(opp.id.as_deref(), Some("42"));
        assert_eq!(opp.issuer, UNKNOWN_ISSUER);
        assert_eq!(opp.description, "");
        assert!(opp.tags.is_empty());
        assert_eq!(opp.territory, Some(json!("La Réunion")));
        assert_eq!(opp.discovered_at, Some(now()));
        assert_eq!(opp.source_last_checked_at, Some(now()));
    }

    #[test]
    fn youth_call_is_dropped_when_only_ami_is_accepted() {
        assert!(normalizer(&[OpportunityType::Ami])
            .normalize(&youth_call(), now())
            .is_none());
    }

    #[test]
    fn blank_title_aborts() {
        let raw = record(json!({"name": "   ", "type": "AAP"}));
        assert!(normalizer(&OpportunityType::ALL).normalize(&raw, now()).is_none());
        let raw = record(json!({"type": "AAP"}));
        assert!(normalizer(&OpportunityType::ALL).normalize(&raw, now()).is_none());
    }

    #[test]
    fn explicit_urls_win_over_synthesized_ones() {
        let raw = record(json!({
            "name": "AAP mobilité",
            "id": 7,
            "external_url": "https://example.org/aap",
            "source_url": "https://example.org/ignored"
        }));
        let opp = normalizer(&OpportunityType::ALL).normalize(&raw, now()).unwrap();
        assert_eq!(opp.url.as_deref(), Some("https://example.org/aap"));
        assert_eq!(opp.id.as_deref(), Some("7"));
    }

    #[test]
    fn aliases_and_defaults_fill_remaining_fields() {
        let raw = record(json!({
            "title": "  AMI culture  ",
            "short_description": "  Projets culturels  ",
            "issuer": " DAC ",
            "period": "Annuel",
            "territories": ["974"],
            "categories": "Culture",
            "amount": null,
            "financial_amount": "10 000 €",
            "closing_date": "2026-06-30T23:59:00Z"
        }));
        let opp = normalizer(&OpportunityType::ALL).normalize(&raw, now()).unwrap();
        assert_eq!(opp.title, "AMI culture");
        assert_eq!(opp.kind, OpportunityType::Ami);
        assert_eq!(opp.description, "Projets culturels");
        assert_eq!(opp.issuer, "DAC");
        assert_eq!(opp.calendar, Some(json!("Annuel")));
        assert_eq!(opp.territory, Some(json!(["974"])));
        assert_eq!(opp.tags, vec!["Culture".to_string()]);
        assert_eq!(opp.amount, Some(json!("10 000 €")));
        assert_eq!(opp.deadline.as_deref(), Some("2026-06-30"));
        assert_eq!(opp.url, None);
        assert_eq!(opp.id, None);
    }

    #[test]
    fn unparseable_deadline_degrades_to_none() {
        let raw = record(json!({"name": "AAP", "deadline": "fin mars"}));
        let opp = normalizer(&OpportunityType::ALL).normalize(&raw, now()).unwrap();
        assert_eq!(opp.deadline, None);
    }

    #[test]
    fn date_extraction_is_pattern_based() {
        assert_eq!(extract_iso_date("avant le 2025-03-01 minuit").as_deref(), Some("2025-03-01"));
        assert_eq!(extract_iso_date("2025-13-45").as_deref(), Some("2025-13-45"));
        assert_eq!(extract_iso_date("01/03/2025"), None);
        assert_eq!(parse_day_start("2025-13-45"), None);
        assert_eq!(
            parse_day_start("2026-09-01T10:00:00+04:00"),
            Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single()
        );
    }
}
