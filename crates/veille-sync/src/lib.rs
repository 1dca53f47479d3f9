//! Collection pipeline: classify, normalize, filter, merge, persist.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;
use veille_adapters::{
    select_working_endpoint, AdapterError, AidesTerritoiresSource, FixtureSource,
    OpportunitySource,
};
use veille_core::{Clock, Opportunity, Snapshot, SnapshotMeta, SourceProvenance, SystemClock};
use veille_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};

pub mod classify;
pub mod config;
pub mod fetch;
pub mod filter;
pub mod merge;
pub mod normalize;
mod raw;

pub use config::{load_collector_config, CollectorConfig, SyncConfig, UpdateStrategy};
pub use fetch::{fetch_items, FetchPlan};
pub use merge::{dedup_key, merge_with_existing};

pub const CRATE_NAME: &str = "veille-sync";

/// Controlled failure of a run. The snapshot on disk is untouched whenever
/// one of these is returned.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error(transparent)]
    Source(#[from] AdapterError),
    #[error("snapshot storage failed: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub endpoint: String,
    pub fetched: usize,
    pub merged: usize,
    pub output_path: String,
    /// SHA-256 of the serialized `opportunities` array.
    pub opportunities_sha256: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    collector: CollectorConfig,
    source: Box<dyn OpportunitySource>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        collector: CollectorConfig,
        source: Box<dyn OpportunitySource>,
    ) -> Self {
        let store = SnapshotStore::new(config.output_path.clone());
        Self {
            config,
            collector,
            source,
            store,
            clock: Arc::new(SystemClock),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full cycle. Nothing is written unless every step succeeds.
    pub async fn run_once(&self) -> Result<SyncRunSummary, CollectorError> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary, CollectorError> {
        let started_at = self.clock.now();

        let existing = self
            .store
            .load_opportunities()
            .await
            .map_err(CollectorError::Storage)?
            .unwrap_or_default();

        let endpoint =
            select_working_endpoint(self.source.as_ref(), &self.config.api_candidates).await?;

        let plan = FetchPlan::new(&self.collector, &self.config);
        let fetched = fetch_items(self.source.as_ref(), &endpoint, &plan, started_at).await?;
        let fetched_count = fetched.len();

        let merged = merge_with_existing(existing, fetched, self.collector.update_strategy);
        let merged_count = merged.len();

        let snapshot = self.build_snapshot(merged, self.clock.now());
        let opportunities_sha256 = opportunities_digest(&snapshot.opportunities)
            .map_err(CollectorError::Storage)?;
        let stored = self
            .store
            .save(&snapshot)
            .await
            .map_err(CollectorError::Storage)?;

        info!(
            fetched = fetched_count,
            merged = merged_count,
            bytes = stored.byte_size,
            content_hash = %stored.content_hash,
            "collected opportunities"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            endpoint,
            fetched: fetched_count,
            merged: merged_count,
            output_path: stored.path.display().to_string(),
            opportunities_sha256,
        })
    }

    fn build_snapshot(&self, opportunities: Vec<Opportunity>, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                generated_at: now,
                sources: vec![SourceProvenance {
                    name: self.config.source_name.clone(),
                    attribution_text: self.config.attribution_text.clone(),
                    last_checked_at: now,
                }],
            },
            opportunities,
        }
    }
}

fn opportunities_digest(opportunities: &[Opportunity]) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(opportunities).context("serializing opportunities for digest")?;
    Ok(SnapshotStore::sha256_hex(&bytes))
}

/// Wire the live API source, or a recorded fixture when `fixture` is given.
pub fn build_pipeline(
    config: SyncConfig,
    fixture: Option<&Path>,
) -> Result<SyncPipeline, CollectorError> {
    let collector = load_collector_config(&config.config_path)?;
    let source: Box<dyn OpportunitySource> = match fixture {
        Some(path) => Box::new(FixtureSource::from_path(path).map_err(CollectorError::Config)?),
        None => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .map_err(CollectorError::Config)?;
            Box::new(AidesTerritoiresSource::new(http))
        }
    };
    Ok(SyncPipeline::new(config, collector, source))
}

/// Cron-driven runs; `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    merged = summary.merged,
                    "scheduled sync complete"
                ),
                Err(err) => error!(
                    error = %err,
                    output = %pipeline.config().output_path.display(),
                    "scheduled sync failed; existing snapshot preserved"
                ),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
