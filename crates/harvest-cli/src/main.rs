use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use harvest_core::JobKind;
use harvest_storage::{MemoryOpportunityStore, PgOpportunityStore};
use harvest_sync::{JobSink, SharedStore, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Opportunity harvesting pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job in the foreground and print its report.
    Run {
        #[arg(long)]
        kind: JobKind,
        #[arg(long)]
        partition: String,
        /// Inclusive start of the window (defaults to the configured lookback).
        #[arg(long)]
        since: Option<NaiveDate>,
        /// Exclusive end of the window.
        #[arg(long)]
        before: Option<NaiveDate>,
        /// Keep records in memory instead of writing them to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Enqueue one job per configured partition and wait for all of them.
    FanOut {
        #[arg(long)]
        kind: Option<JobKind>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the queues and the daily scheduler until Ctrl-C.
    Work {
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HARVEST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn store(config: &SyncConfig, dry_run: bool) -> Result<SharedStore> {
    if dry_run {
        return Ok(Arc::new(MemoryOpportunityStore::new()));
    }
    let store = PgOpportunityStore::connect(&config.database_url, 5)
        .await
        .context("connecting to the opportunity database")?;
    Ok(Arc::new(store))
}

fn default_since(config: &SyncConfig) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(config.lookback_days)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run {
            kind,
            partition,
            since,
            before,
            dry_run,
        } => {
            let since = since.unwrap_or_else(|| default_since(&config));
            let store = store(&config, dry_run).await?;
            let pipeline = SyncPipeline::load(config, store).await?;
            let job = pipeline.job(kind, &partition, since, before)?;
            let report = pipeline.run_once(&job).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::FanOut { kind, dry_run } => {
            let store = store(&config, dry_run).await?;
            let pipeline = SyncPipeline::load(config, store).await?;
            let queues = pipeline.start_queues(1, CancellationToken::new()).await?;
            let summary = pipeline
                .fan_out()
                .run(&queues, Utc::now().date_naive(), kind)
                .await;
            queues.wait_idle().await;
            let failed: usize = queues
                .kinds()
                .filter_map(|k| queues.get(k))
                .map(|q| q.failed().len())
                .sum();
            println!(
                "fan-out complete: planned={} enqueued={} failed_to_enqueue={} failed_jobs={}",
                summary.planned, summary.enqueued, summary.failed, failed
            );
            queues.shutdown().await;
        }
        Commands::Work { concurrency } => {
            let store = store(&config, false).await?;
            let pipeline = SyncPipeline::load(config, store).await?;
            let queues = Arc::new(pipeline.start_queues(concurrency, CancellationToken::new()).await?);
            let sink: Arc<dyn JobSink> = queues.clone();
            let mut scheduler = pipeline.scheduler(sink).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().scheduler_cron, "worker running, Ctrl-C to stop");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
            scheduler.shutdown().await.context("stopping scheduler")?;
            queues.shutdown().await;
        }
        Commands::Migrate => {
            let store = PgOpportunityStore::connect(&config.database_url, 1)
                .await
                .context("connecting to the opportunity database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
