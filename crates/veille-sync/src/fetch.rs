//! Paginated collection: territory, type, keyword and freshness gates.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;
use veille_adapters::{AdapterError, OpportunitySource, PageRequest};
use veille_core::{Opportunity, RawRecord};

use crate::classify::TerritoryMatcher;
use crate::config::{CollectorConfig, SyncConfig};
use crate::filter::KeywordFilter;
use crate::normalize::{parse_day_start, Normalizer};
use crate::raw::first_truthy_text;

pub const PAGE_SIZE: u32 = 50;

/// Hard ceiling on pages per run, whatever the source reports.
pub const MAX_PAGES: u32 = 80;

const UPDATED_KEYS: [&str; 3] = ["date_updated", "updated_at", "updated"];

#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub territory: TerritoryMatcher,
    pub normalizer: Normalizer,
    pub keywords: KeywordFilter,
    pub freshness_days: u32,
    pub max_items: usize,
}

impl FetchPlan {
    pub fn new(collector: &CollectorConfig, sync: &SyncConfig) -> Self {
        Self {
            territory: TerritoryMatcher::new(&collector.territory_code, &collector.territory_aliases),
            normalizer: Normalizer::new(
                collector.accepted_types(),
                sync.detail_url_base.clone(),
                sync.source_name.clone(),
            ),
            keywords: KeywordFilter::new(&collector.keywords_include, &collector.keywords_exclude),
            freshness_days: collector.freshness_days,
            max_items: collector.max_items,
        }
    }

    /// Oldest acceptable update instant.
    pub fn freshness_threshold(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        TimeDelta::try_days(i64::from(self.freshness_days))
            .and_then(|window| now.checked_sub_signed(window))
    }

    /// Run one raw item through every gate.
    pub fn admit(&self, item: &JsonValue, now: DateTime<Utc>) -> Option<Opportunity> {
        let raw = item.as_object()?;
        if !self.territory.matches(raw) {
            return None;
        }
        let normalized = self.normalizer.normalize(raw, now)?;
        if !self.keywords.accepts(&normalized) {
            return None;
        }
        if is_stale(raw, self.freshness_threshold(now)) {
            return None;
        }
        Some(normalized)
    }
}

/// Only a parseable update date older than the threshold makes a record stale.
fn is_stale(raw: &RawRecord, threshold: Option<DateTime<Utc>>) -> bool {
    let Some(threshold) = threshold else {
        return false;
    };
    first_truthy_text(raw, &UPDATED_KEYS)
        .and_then(|text| parse_day_start(&text))
        .is_some_and(|updated| updated < threshold)
}

pub async fn fetch_items(
    source: &dyn OpportunitySource,
    endpoint: &str,
    plan: &FetchPlan,
    now: DateTime<Utc>,
) -> Result<Vec<Opportunity>, AdapterError> {
    let mut items = Vec::new();
    let mut page = 1u32;

    while page <= MAX_PAGES && items.len() < plan.max_items {
        let data = source
            .fetch_page(endpoint, &PageRequest::new(page, PAGE_SIZE))
            .await?;
        if data.results.is_empty() {
            break;
        }

        let before = items.len();
        for raw in &data.results {
            if let Some(item) = plan.admit(raw, now) {
                items.push(item);
                if items.len() >= plan.max_items {
                    break;
                }
            }
        }
        debug!(
            page,
            results = data.results.len(),
            kept = items.len() - before,
            "page processed"
        );

        if !data.has_next {
            break;
        }
        page += 1;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use veille_adapters::Page;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 6, 0, 0).single().unwrap()
    }

    fn plan(max_items: usize) -> FetchPlan {
        let collector = CollectorConfig {
            max_items,
            ..CollectorConfig::default()
        };
        FetchPlan::new(&collector, &SyncConfig::default())
    }

    fn call(id: u32, updated: &str) -> JsonValue {
        json!({
            "id": id,
            "name": format!("Appel à projets n°{id}"),
            "perimeters": [{"code": "974"}],
            "date_updated": updated
        })
    }

    /// Serves the same page forever and counts requests.
    struct EndlessSource {
        page: Vec<JsonValue>,
        requests: AtomicU32,
    }

    #[async_trait]
    impl OpportunitySource for EndlessSource {
        fn source_id(&self) -> &'static str {
            "endless"
        }

        async fn probe(&self, _endpoint: &str) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn fetch_page(&self, _endpoint: &str, _request: &PageRequest) -> Result<Page, AdapterError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(Page {
                results: self.page.clone(),
                has_next: true,
            })
        }
    }

    #[test]
    fn stale_records_are_dropped_but_undated_or_invalid_ones_kept() {
        let plan = plan(300);
        assert!(plan.admit(&call(1, "2026-09-30"), now()).is_some());
        assert!(plan.admit(&call(2, "2025-01-01"), now()).is_none());
        assert!(plan.admit(&call(3, "2025-13-45"), now()).is_some());
        assert!(plan.admit(&call(4, ""), now()).is_some());
    }

    #[test]
    fn non_objects_and_foreign_territories_are_rejected() {
        let plan = plan(300);
        assert!(plan.admit(&json!("text"), now()).is_none());
        let foreign = json!({"name": "Appel à projets", "perimeters": [{"name": "Bretagne"}]});
        assert!(plan.admit(&foreign, now()).is_none());
    }

    #[test]
    fn threshold_is_freshness_days_before_now() {
        let expected = Utc.with_ymd_and_hms(2025, 10, 18, 6, 0, 0).single();
        assert_eq!(plan(1).freshness_threshold(now()), expected);
    }

    #[tokio::test]
    async fn page_ceiling_bounds_a_source_that_never_ends() {
        let source = EndlessSource {
            page: vec![json!({"name": "Sans territoire"})],
            requests: AtomicU32::new(0),
        };
        let items = fetch_items(&source, "endpoint", &plan(300), now()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(source.requests.load(Ordering::SeqCst), MAX_PAGES);
    }

    #[tokio::test]
    async fn max_items_stops_mid_page_and_before_next_page() {
        let source = EndlessSource {
            page: (1..=5).map(|id| call(id, "2026-10-01")).collect(),
            requests: AtomicU32::new(0),
        };
        let items = fetch_items(&source, "endpoint", &plan(3), now()).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(source.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_page_stops_the_loop() {
        let source = EndlessSource {
            page: vec![],
            requests: AtomicU32::new(0),
        };
        let items = fetch_items(&source, "endpoint", &plan(300), now()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(source.requests.load(Ordering::SeqCst), 1);
    }
}
