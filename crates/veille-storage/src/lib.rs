//! Atomic snapshot storage + HTTP JSON fetch utilities for veille.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use veille_core::{Opportunity, Snapshot};

pub const CRATE_NAME: &str = "veille-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
}

/// JSON snapshot file, read once per run and replaced wholesale on success.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Previously persisted opportunities, or `None` when no snapshot exists yet.
    ///
    /// A document that is not an object, or whose `opportunities` member is
    /// missing or not an array, yields an empty list. Entries that do not
    /// deserialize as opportunities are an error: the run must not rewrite a
    /// file it could not fully read.
    pub async fn load_opportunities(&self) -> anyhow::Result<Option<Vec<Opportunity>>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }

        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let document: JsonValue = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        let opportunities = match document.get("opportunities") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<Opportunity>(item.clone()).with_context(|| {
                        format!(
                            "decoding opportunities[{index}] in {}",
                            self.path.display()
                        )
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Some(opportunities))
    }

    /// Pretty JSON, two-space indent, trailing newline.
    pub fn render(snapshot: &Snapshot) -> anyhow::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Replace the snapshot file through a temp file + rename so readers never
    /// observe a partial document.
    pub async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<StoredSnapshot> {
        let bytes = Self::render(snapshot)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("writing temp snapshot file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            path: self.path.clone(),
            byte_size: bytes.len(),
            content_hash: Self::sha256_hex(&bytes),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected content-type for {url}: {content_type:?}")]
    UnexpectedContentType { url: String, content_type: String },
    #[error("malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and decode the body as JSON.
    ///
    /// Retryable statuses and connection failures are retried per the backoff
    /// policy; a non-JSON content type is rejected without retrying.
    pub async fn get_json<Q>(&self, url: &str, query: &Q) -> Result<JsonValue, FetchError>
    where
        Q: Serialize + Sync + ?Sized,
    {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0usize;
            loop {
                let sent = self
                    .client
                    .get(url)
                    .header(ACCEPT, "application/json")
                    .query(query)
                    .send()
                    .await;

                let err = match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            return decode_json_response(resp, final_url).await;
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(status = status.as_u16(), attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => err,
                };

                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                    && attempt < self.backoff.max_retries
                {
                    debug!(error = %err, attempt, "retrying after request error");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(FetchError::Request(err));
            }
        }
        .instrument(span)
        .await
    }
}

async fn decode_json_response(
    resp: reqwest::Response,
    url: String,
) -> Result<JsonValue, FetchError> {
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    ensure_json_content_type(&url, content_type)?;

    let body = resp.bytes().await?;
    parse_json_body(url, &body)
}

/// Anything other than a JSON media type is rejected before reading the body.
fn ensure_json_content_type(url: &str, content_type: Option<&str>) -> Result<(), FetchError> {
    match content_type {
        Some(value) if value.contains("json") => Ok(()),
        other => Err(FetchError::UnexpectedContentType {
            url: url.to_string(),
            content_type: other.unwrap_or_default().to_string(),
        }),
    }
}

fn parse_json_body(url: String, body: &[u8]) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode { url, source })
}
