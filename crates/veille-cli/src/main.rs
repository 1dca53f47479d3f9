use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use veille_sync::{build_pipeline, maybe_build_scheduler, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "veille")]
#[command(about = "Collect AAP/AMI funding opportunities from Aides-territoires")]
struct Cli {
    /// Log filter directive, e.g. `info` or `veille_sync=debug`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and rewrite the snapshot once.
    Sync(SyncArgs),
    /// Run the sync on the configured cron expression until interrupted.
    Schedule(SyncArgs),
}

#[derive(Debug, Clone, Default, clap::Args)]
struct SyncArgs {
    /// Collector configuration file (JSON or YAML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Snapshot file to merge into and rewrite.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Replay a recorded page bundle instead of calling the API.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

impl SyncArgs {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(path) = &self.config {
            config.config_path = path.clone();
        }
        if let Some(path) = &self.output {
            config.output_path = path.clone();
        }
        config
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let outcome = match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync_once(args).await,
        Commands::Schedule(args) => schedule(args).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("collection failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn sync_once(args: SyncArgs) -> Result<()> {
    let config = args.sync_config();
    let output = config.output_path.clone();

    let result = match build_pipeline(config, args.fixture.as_deref()) {
        Ok(pipeline) => pipeline.run_once().await,
        Err(err) => Err(err),
    };

    match result {
        Ok(summary) => {
            println!(
                "sync complete: run_id={} endpoint={} fetched={} merged={} output={} sha256={}",
                summary.run_id,
                summary.endpoint,
                summary.fetched,
                summary.merged,
                summary.output_path,
                summary.opportunities_sha256
            );
            Ok(())
        }
        Err(err) => {
            error!("existing snapshot was preserved at {}", output.display());
            Err(err.into())
        }
    }
}

async fn schedule(args: SyncArgs) -> Result<()> {
    let pipeline = Arc::new(build_pipeline(args.sync_config(), args.fixture.as_deref())?);
    let Some(mut sched) = maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
        anyhow::bail!("scheduler disabled; set VEILLE_SCHEDULER_ENABLED=1");
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
