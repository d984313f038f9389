use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::join_all;
use harvest_core::{JobKind, SourceJob};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::{SourceConfig, SourceRegistry};
use crate::queue::JobSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutSummary {
    pub planned: usize,
    pub enqueued: usize,
    pub failed: usize,
}

/// Turns the source registry into one job per (kind, partition) pair.
#[derive(Debug, Clone)]
pub struct FanOut {
    registry: SourceRegistry,
    lookback_days: i64,
}

impl FanOut {
    pub fn new(registry: SourceRegistry, lookback_days: i64) -> Self {
        Self {
            registry,
            lookback_days: lookback_days.max(0),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Jobs covering `[today - lookback, open)` for every enabled source, or only `only`.
    pub fn plan(&self, today: NaiveDate, only: Option<JobKind>) -> Vec<SourceJob> {
        let since = today - ChronoDuration::days(self.lookback_days);
        self.registry
            .enabled()
            .filter(|source| only.map_or(true, |kind| kind == source.kind))
            .flat_map(|source| {
                source
                    .partitions
                    .iter()
                    .map(move |partition| job_for(source, partition, since, None))
            })
            .collect()
    }

    /// Submit every job concurrently; one failed submission never blocks the others.
    pub async fn submit<S: JobSink + ?Sized>(&self, sink: &S, jobs: Vec<SourceJob>) -> FanOutSummary {
        let planned = jobs.len();
        let results = join_all(jobs.into_iter().map(|job| async move {
            let (kind, partition) = (job.kind, job.partition_key.clone());
            match sink.submit(job).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(%kind, %partition, error = %err, "enqueue failed");
                    false
                }
            }
        }))
        .await;
        let enqueued = results.iter().filter(|ok| **ok).count();
        FanOutSummary {
            planned,
            enqueued,
            failed: planned - enqueued,
        }
    }

    pub async fn run<S: JobSink + ?Sized>(&self, sink: &S, today: NaiveDate, only: Option<JobKind>) -> FanOutSummary {
        let summary = self.submit(sink, self.plan(today, only)).await;
        info!(
            planned = summary.planned,
            enqueued = summary.enqueued,
            failed = summary.failed,
            "fan-out finished"
        );
        summary
    }
}

/// Build a job for one partition, carrying the source's policies and filters.
pub fn job_for(source: &SourceConfig, partition: &str, since: NaiveDate, before: Option<NaiveDate>) -> SourceJob {
    let mut job = SourceJob::new(source.kind, partition, since)
        .with_before(before)
        .with_retry(source.job_retry)
        .with_removal(source.removal);
    job.extra_filters = source.filters.clone();
    job
}

/// Register the recurring fan-out. The caller starts and shuts down the scheduler.
pub async fn build_scheduler(cron: &str, fan_out: Arc<FanOut>, sink: Arc<dyn JobSink>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let fan_out = Arc::clone(&fan_out);
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            let today = Utc::now().date_naive();
            info!(%today, "scheduled fan-out starting");
            fan_out.run(sink.as_ref(), today, None).await;
        })
    })
    .with_context(|| format!("creating scheduled fan-out for `{cron}`"))?;
    sched.add(job).await.context("adding scheduled fan-out")?;
    Ok(sched)
}
