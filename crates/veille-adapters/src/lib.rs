//! Data-source contracts + the Aides-territoires API and fixture adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use veille_core::is_truthy;
use veille_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "veille-adapters";

/// Endpoints tried in order when no override is configured.
pub const DEFAULT_API_CANDIDATES: [&str; 2] = [
    "https://aides-territoires.beta.gouv.fr/api/aids/",
    "https://aides-territoires.incubateur.net/api/aids/",
];

/// Most recently updated first.
pub const DEFAULT_ORDERING: &str = "-date_updated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub ordering: String,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ordering: DEFAULT_ORDERING.to_string(),
        }
    }

    fn probe() -> Self {
        Self {
            page: 1,
            page_size: 1,
            ordering: String::new(),
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("page_size", self.page_size.to_string()),
        ];
        if !self.ordering.is_empty() {
            pairs.push(("ordering", self.ordering.clone()));
        }
        pairs
    }
}

/// One page of raw upstream records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub results: Vec<JsonValue>,
    pub has_next: bool,
}

impl Page {
    /// Interpret a paginated API payload (`results` + `next`).
    pub fn from_api_payload(payload: &JsonValue) -> Self {
        let results = match payload.get("results") {
            Some(JsonValue::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let has_next = payload.get("next").is_some_and(is_truthy);
        Self { results, has_next }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no reachable endpoint among {tried:?}")]
    NoReachableEndpoint { tried: Vec<String> },
    #[error("endpoint {0} is unavailable")]
    Unavailable(String),
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Cheap single-item request used to pick a working endpoint.
    async fn probe(&self, endpoint: &str) -> Result<(), AdapterError>;

    async fn fetch_page(&self, endpoint: &str, request: &PageRequest) -> Result<Page, AdapterError>;
}

/// First candidate whose probe succeeds.
pub async fn select_working_endpoint(
    source: &dyn OpportunitySource,
    candidates: &[String],
) -> Result<String, AdapterError> {
    for candidate in candidates {
        match source.probe(candidate).await {
            Ok(()) => {
                info!(source_id = source.source_id(), endpoint = %candidate, "using API endpoint");
                return Ok(candidate.clone());
            }
            Err(err) => {
                warn!(source_id = source.source_id(), endpoint = %candidate, error = %err, "cannot use endpoint");
            }
        }
    }
    Err(AdapterError::NoReachableEndpoint {
        tried: candidates.to_vec(),
    })
}

pub struct AidesTerritoiresSource {
    http: HttpFetcher,
}

impl AidesTerritoiresSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl OpportunitySource for AidesTerritoiresSource {
    fn source_id(&self) -> &'static str {
        "aides-territoires"
    }

    async fn probe(&self, endpoint: &str) -> Result<(), AdapterError> {
        self.http
            .get_json(endpoint, &PageRequest::probe().query_pairs())
            .await?;
        Ok(())
    }

    async fn fetch_page(&self, endpoint: &str, request: &PageRequest) -> Result<Page, AdapterError> {
        let payload = self.http.get_json(endpoint, &request.query_pairs()).await?;
        Ok(Page::from_api_payload(&payload))
    }
}

/// Recorded API pages, replayed offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    /// Endpoints whose probe must fail when replaying this bundle.
    #[serde(default)]
    pub unreachable_endpoints: Vec<String>,
    /// Raw API payloads, page 1 first.
    pub pages: Vec<JsonValue>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }
}

#[async_trait]
impl OpportunitySource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn probe(&self, endpoint: &str) -> Result<(), AdapterError> {
        if self
            .bundle
            .unreachable_endpoints
            .iter()
            .any(|blocked| blocked == endpoint)
        {
            return Err(AdapterError::Unavailable(endpoint.to_string()));
        }
        Ok(())
    }

    async fn fetch_page(&self, _endpoint: &str, request: &PageRequest) -> Result<Page, AdapterError> {
        let index = request.page.saturating_sub(1) as usize;
        Ok(self
            .bundle
            .pages
            .get(index)
            .map(Page::from_api_payload)
            .unwrap_or_default())
    }
}
