//! Collector configuration file + runtime wiring from the environment.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use veille_adapters::DEFAULT_API_CANDIDATES;
use veille_core::OpportunityType;

use crate::CollectorError;

pub const DEFAULT_SOURCE_NAME: &str = "Aides-territoires API";

pub const DEFAULT_ATTRIBUTION: &str = "Données issues de l'API Aides-territoires (Licence Ouverte v2.0). \
Réutilisation sous réserve du respect des conditions d'utilisation et de l'attribution.";

pub const DEFAULT_DETAIL_URL_BASE: &str = "https://aides-territoires.beta.gouv.fr/aides/";

/// What happens when a fetched opportunity matches one already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    /// The stored entry is kept untouched.
    #[default]
    #[serde(rename = "merge_by_url_then_title")]
    KeepExisting,
    /// The fetched fields replace the stored ones; `discovered_at` is kept.
    #[serde(rename = "refresh_by_url_then_title")]
    RefreshKeepDiscovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub territory_code: String,
    pub territory_aliases: Vec<String>,
    pub include_types: Vec<String>,
    pub keywords_include: Vec<String>,
    pub keywords_exclude: Vec<String>,
    pub freshness_days: u32,
    pub max_items: usize,
    pub update_strategy: UpdateStrategy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            territory_code: "974".to_string(),
            territory_aliases: vec!["réunion".to_string(), "reunion".to_string()],
            include_types: vec!["AAP".to_string(), "AMI".to_string()],
            keywords_include: Vec::new(),
            keywords_exclude: Vec::new(),
            freshness_days: 365,
            max_items: 300,
            update_strategy: UpdateStrategy::default(),
        }
    }
}

impl CollectorConfig {
    /// Accepted categories, in configured order. Unknown codes are skipped.
    pub fn accepted_types(&self) -> Vec<OpportunityType> {
        let mut accepted = Vec::new();
        for code in &self.include_types {
            match OpportunityType::from_code(code) {
                Some(kind) if !accepted.contains(&kind) => accepted.push(kind),
                Some(_) => {}
                None => warn!(code = %code, "ignoring unknown opportunity type"),
            }
        }
        accepted
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

/// Read the collector config. YAML when the extension says so, JSON otherwise.
pub fn load_collector_config(path: &Path) -> Result<CollectorConfig, CollectorError> {
    parse_collector_config(path).map_err(CollectorError::Config)
}

fn parse_collector_config(path: &Path) -> anyhow::Result<CollectorConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let document: JsonValue = if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    };
    if !document.is_object() {
        return Err(anyhow!("invalid config format in {}", path.display()));
    }
    serde_json::from_value(document).with_context(|| format!("decoding {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub output_path: PathBuf,
    pub api_candidates: Vec<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub source_name: String,
    pub attribution_text: String,
    pub detail_url_base: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("data/collector.config.json"),
            output_path: PathBuf::from("data/opportunities.seed.json"),
            api_candidates: DEFAULT_API_CANDIDATES.iter().map(|s| s.to_string()).collect(),
            http_timeout_secs: 25,
            user_agent: "veille-aap-ami-bot/1.0".to_string(),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            attribution_text: DEFAULT_ATTRIBUTION.to_string(),
            detail_url_base: DEFAULT_DETAIL_URL_BASE.to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: std::env::var("VEILLE_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            output_path: std::env::var("VEILLE_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            api_candidates: std::env::var("VEILLE_API_CANDIDATES")
                .ok()
                .map(|v| parse_candidates(&v))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.api_candidates),
            http_timeout_secs: std::env::var("VEILLE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("VEILLE_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("VEILLE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("VEILLE_SYNC_CRON").unwrap_or(defaults.sync_cron),
            ..defaults
        }
    }
}

fn parse_candidates(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
