//! Deduplication and deterministic ordering of stored + fetched opportunities.

use std::collections::HashMap;
use std::collections::HashSet;

use veille_core::Opportunity;

use crate::config::UpdateStrategy;

/// Sort position for opportunities without a deadline: after every dated one.
pub const NO_DEADLINE_SENTINEL: &str = "9999-12-31";

/// Identity of an opportunity across runs: the URL when there is one,
/// otherwise title plus deadline.
pub fn dedup_key(item: &Opportunity) -> String {
    let url = item
        .url
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if !url.is_empty() {
        return format!("url::{url}");
    }
    let title = item.title.trim().to_lowercase();
    let deadline = item.deadline.as_deref().unwrap_or_default();
    format!("title_deadline::{title}::{deadline}")
}

/// Keep the first occurrence of each key, preserving input order.
pub fn deduplicate(items: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(dedup_key(item)))
        .collect()
}

pub fn merge_with_existing(
    existing: Vec<Opportunity>,
    fresh: Vec<Opportunity>,
    strategy: UpdateStrategy,
) -> Vec<Opportunity> {
    let mut merged = match strategy {
        UpdateStrategy::KeepExisting => {
            let mut all = existing;
            all.extend(fresh);
            deduplicate(all)
        }
        UpdateStrategy::RefreshKeepDiscovered => refresh_existing(existing, fresh),
    };
    merged.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    merged
}

/// Fresh fields replace the stored entry in place; the stored
/// `discovered_at` and foreign keys survive.
fn refresh_existing(existing: Vec<Opportunity>, fresh: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut merged = deduplicate(existing);
    let mut positions: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(index, item)| (dedup_key(item), index))
        .collect();

    for mut item in deduplicate(fresh) {
        let key = dedup_key(&item);
        match positions.get(&key).copied() {
            Some(index) => {
                let stored = &mut merged[index];
                item.discovered_at = stored.discovered_at.or(item.discovered_at);
                item.extra = std::mem::take(&mut stored.extra);
                *stored = item;
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(item);
            }
        }
    }
    merged
}

fn sort_key(item: &Opportunity) -> (&str, Option<chrono::DateTime<chrono::Utc>>) {
    let deadline = item
        .deadline
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or(NO_DEADLINE_SENTINEL);
    (deadline, item.discovered_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use veille_core::OpportunityType;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 8, 0, 0).single().unwrap()
    }

    fn opp(title: &str, url: Option<&str>, deadline: Option<&str>, discovered: u32) -> Opportunity {
        Opportunity {
            id: None,
            title: title.into(),
            issuer: "Région Réunion".into(),
            deadline: deadline.map(str::to_string),
            calendar: None,
            url: url.map(str::to_string),
            description: String::new(),
            territory: None,
            tags: vec![],
            kind: OpportunityType::Aap,
            amount: None,
            source: "Aides-territoires API".into(),
            source_last_checked_at: Some(at(discovered)),
            discovered_at: Some(at(discovered)),
            extra: Default::default(),
        }
    }

    #[test]
    fn url_key_ignores_case_and_surrounding_whitespace() {
        let a = opp("A", Some(" HTTPS://Example.org/Aide "), None, 1);
        let b = opp("B", Some("https://example.org/aide"), None, 2);
        assert_eq!(dedup_key(&a), "url::https://example.org/aide");
        assert_eq!(dedup_key(&a), dedup_key(&b));
        assert_eq!(deduplicate(vec![a, b]).len(), 1);
    }

    #[test]
    fn missing_url_falls_back_to_title_and_deadline() {
        let a = opp("  Appel Jeunesse ", None, Some("2026-03-01"), 1);
        assert_eq!(dedup_key(&a), "title_deadline::appel jeunesse::2026-03-01");
        let b = opp("Appel Jeunesse", Some("   "), None, 1);
        assert_eq!(dedup_key(&b), "title_deadline::appel jeunesse::");
    }

    #[test]
    fn existing_entry_wins_and_keeps_discovery_time() {
        let mut stored = opp("Ancien titre", Some("https://x.test/1"), Some("2026-05-01"), 1);
        stored.description = "ancienne description".into();
        let mut refetched = opp("Nouveau titre", Some("https://X.test/1"), Some("2026-06-01"), 9);
        refetched.description = "nouvelle description".into();

        let merged = merge_with_existing(vec![stored.clone()], vec![refetched], UpdateStrategy::KeepExisting);
        assert_eq!(merged, vec![stored]);
        assert_eq!(merged[0].discovered_at, Some(at(1)));
    }

    #[test]
    fn refresh_strategy_takes_fresh_fields_but_keeps_discovery_time() {
        let mut stored = opp("Ancien titre", Some("https://x.test/1"), Some("2026-05-01"), 1);
        stored.extra.insert("curator_note".into(), json!("pinned"));
        let refetched = opp("Nouveau titre", Some("https://x.test/1"), Some("2026-06-01"), 9);

        let merged = merge_with_existing(
            vec![stored],
            vec![refetched],
            UpdateStrategy::RefreshKeepDiscovered,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].title, "Nouveau titre");
        assert_eq!(merged[0].deadline.as_deref(), Some("2026-06-01"));
        assert_eq!(merged[0].discovered_at, Some(at(1)));
        assert_eq!(merged[0].source_last_checked_at, Some(at(9)));
        assert_eq!(merged[0].extra.get("curator_note"), Some(&json!("pinned")));
    }

    #[test]
    fn undated_stored_entries_sort_first_and_adopt_fresh_discovery_time() {
        let mut curated = opp("Curated", Some("https://x.test/curated"), Some("2026-03-01"), 1);
        curated.discovered_at = None;
        let peer = opp("Peer", Some("https://x.test/peer"), Some("2026-03-01"), 2);

        let kept = merge_with_existing(
            vec![peer.clone(), curated.clone()],
            vec![],
            UpdateStrategy::KeepExisting,
        );
        assert_eq!(kept[0].title, "Curated");
        assert_eq!(kept[0].discovered_at, None);

        let refreshed = merge_with_existing(
            vec![curated],
            vec![opp("Curated", Some("https://x.test/curated"), Some("2026-03-01"), 7)],
            UpdateStrategy::RefreshKeepDiscovered,
        );
        assert_eq!(refreshed[0].discovered_at, Some(at(7)));
    }

    #[test]
    fn merging_the_same_fetch_twice_is_idempotent() {
        let fresh = vec![
            opp("A", Some("https://x.test/a"), Some("2026-04-01"), 3),
            opp("B", None, None, 2),
            opp("C", Some("https://x.test/c"), Some("2026-02-01"), 4),
        ];
        for strategy in [UpdateStrategy::KeepExisting, UpdateStrategy::RefreshKeepDiscovered] {
            let once = merge_with_existing(vec![], fresh.clone(), strategy);
            let twice = merge_with_existing(once.clone(), fresh.clone(), strategy);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn ordering_is_by_deadline_then_discovery_with_undated_last() {
        let merged = merge_with_existing(
            vec![
                opp("undated-early", None, None, 1),
                opp("late", Some("https://x.test/late"), Some("2026-09-01"), 2),
            ],
            vec![
                opp("soon-b", Some("https://x.test/b"), Some("2026-03-01"), 5),
                opp("soon-a", Some("https://x.test/a"), Some("2026-03-01"), 3),
                opp("blank-deadline", Some("https://x.test/blank"), Some(""), 4),
            ],
            UpdateStrategy::KeepExisting,
        );

        let titles: Vec<_> = merged.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["soon-a", "soon-b", "late", "undated-early", "blank-deadline"]
        );
        for pair in merged.windows(2) {
            assert!(sort_key(&pair[0]) <= sort_key(&pair[1]));
        }
    }
}
