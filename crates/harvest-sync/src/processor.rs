use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use harvest_adapters::{AdapterError, Harvest, SourceAdapter};
use harvest_core::{CandidateRecord, JobKind, ProcessingStats, SourceJob};
use harvest_storage::{ArchiveError, ArchiveWriter, OpportunityStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::enrich::Enricher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    /// Persistence failed after earlier phases produced results.
    Degraded,
    Failed,
    /// Dropped by a shutdown while waiting to run or to be retried.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub fetch_ms: u64,
    pub transform_ms: u64,
    pub enrich_ms: u64,
    pub persist_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub partition_key: String,
    pub outcome: JobOutcome,
    pub stats: ProcessingStats,
    pub timings: PhaseTimings,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("fetching {kind}/{partition} failed: {source}")]
    Fetch {
        kind: JobKind,
        partition: String,
        stats: ProcessingStats,
        #[source]
        source: AdapterError,
    },
    #[error("adapter for {adapter} cannot run a {job} job")]
    KindMismatch { adapter: JobKind, job: JobKind },
    #[error("persisting {kind} records failed: {source}", kind = .report.kind)]
    Persist {
        report: Box<JobReport>,
        #[source]
        source: ArchiveError,
    },
}

impl ProcessError {
    pub fn stats(&self) -> ProcessingStats {
        match self {
            ProcessError::Fetch { stats, .. } => *stats,
            ProcessError::KindMismatch { .. } => ProcessingStats::default(),
            ProcessError::Persist { report, .. } => report.stats,
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match self {
            ProcessError::Persist { report, .. } => report.outcome,
            _ => JobOutcome::Failed,
        }
    }
}

/// Something a queue worker can hand a job to.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &SourceJob) -> Result<JobReport, ProcessError>;
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn log_stats(job: &SourceJob, outcome: JobOutcome, stats: &ProcessingStats, timings: &PhaseTimings) {
    info!(
        job_id = %job.id,
        kind = %job.kind,
        partition = %job.partition_key,
        outcome = ?outcome,
        fetched = stats.fetched,
        valid = stats.valid,
        invalid = stats.invalid,
        enriched = stats.enriched,
        inserted = stats.inserted,
        duplicates_skipped = stats.duplicates_skipped,
        errors = stats.errors,
        fetch_ms = timings.fetch_ms,
        transform_ms = timings.transform_ms,
        enrich_ms = timings.enrich_ms,
        persist_ms = timings.persist_ms,
        "job finished"
    );
}

/// Fetch, transform, enrich, validate and persist one source job.
pub struct SourceProcessor<S> {
    adapter: Box<dyn SourceAdapter>,
    enricher: Enricher,
    writer: ArchiveWriter<S>,
}

impl<S: OpportunityStore> SourceProcessor<S> {
    pub fn new(adapter: Box<dyn SourceAdapter>, enricher: Enricher, writer: ArchiveWriter<S>) -> Self {
        Self {
            adapter,
            enricher,
            writer,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.adapter.kind()
    }

    pub fn writer(&self) -> &ArchiveWriter<S> {
        &self.writer
    }

    pub async fn process(&self, job: &SourceJob) -> Result<JobReport, ProcessError> {
        if job.kind != self.adapter.kind() {
            return Err(ProcessError::KindMismatch {
                adapter: self.adapter.kind(),
                job: job.kind,
            });
        }
        let span = info_span!("job", job_id = %job.id, kind = %job.kind, partition = %job.partition_key);
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: &SourceJob) -> Result<JobReport, ProcessError> {
        let mut stats = ProcessingStats::default();
        let mut timings = PhaseTimings::default();

        let started = Instant::now();
        let harvest = match self.adapter.harvest(job).await {
            Ok(harvest) => harvest,
            Err(source) => {
                timings.fetch_ms = elapsed_ms(started);
                stats.errors += 1;
                error!(error = %source, "fetch phase failed");
                log_stats(job, JobOutcome::Failed, &stats, &timings);
                return Err(ProcessError::Fetch {
                    kind: job.kind,
                    partition: job.partition_key.clone(),
                    stats,
                    source,
                });
            }
        };
        timings.fetch_ms = elapsed_ms(started);
        stats.fetched = harvest.fetched() as u64;

        let started = Instant::now();
        let candidates = transform(harvest, Utc::now().date_naive(), &mut stats);
        timings.transform_ms = elapsed_ms(started);

        let started = Instant::now();
        let candidates = self.enricher.enrich_all(candidates, &mut stats).await;
        timings.enrich_ms = elapsed_ms(started);

        let valid: Vec<CandidateRecord> = candidates
            .into_iter()
            .filter(|candidate| match candidate.validate() {
                Ok(()) => true,
                Err(reason) => {
                    debug!(external_id = %candidate.external_id, %reason, "dropped before persistence");
                    stats.invalid += 1;
                    false
                }
            })
            .collect();
        stats.valid = valid.len() as u64;

        let started = Instant::now();
        let written = self.writer.write(&valid).await;
        timings.persist_ms = elapsed_ms(started);

        match written {
            Ok(summary) => {
                stats.inserted = summary.inserted;
                stats.duplicates_skipped = summary.duplicates_skipped;
                log_stats(job, JobOutcome::Completed, &stats, &timings);
                Ok(report(job, JobOutcome::Completed, stats, timings))
            }
            Err(source) => {
                let partial = source.partial();
                stats.inserted = partial.inserted;
                stats.duplicates_skipped = partial.duplicates_skipped;
                stats.errors += 1;
                let outcome = if stats.has_useful_work() {
                    JobOutcome::Degraded
                } else {
                    JobOutcome::Failed
                };
                error!(error = %source, "persist phase failed");
                log_stats(job, outcome, &stats, &timings);
                Err(ProcessError::Persist {
                    report: Box::new(report(job, outcome, stats, timings)),
                    source,
                })
            }
        }
    }
}

fn report(job: &SourceJob, outcome: JobOutcome, stats: ProcessingStats, timings: PhaseTimings) -> JobReport {
    JobReport {
        job_id: job.id,
        kind: job.kind,
        partition_key: job.partition_key.clone(),
        outcome,
        stats,
        timings,
    }
}

/// Map raw records to candidates; records missing identity or location count as invalid.
fn transform(harvest: Harvest, observed_on: NaiveDate, stats: &mut ProcessingStats) -> Vec<CandidateRecord> {
    match harvest {
        Harvest::Raw(records) => records
            .into_iter()
            .filter_map(|raw| match CandidateRecord::from_raw(raw, observed_on) {
                Ok(candidate) => Some(candidate),
                Err(reason) => {
                    debug!(%reason, "raw record rejected");
                    stats.invalid += 1;
                    None
                }
            })
            .collect(),
        Harvest::Assembled(batch) => {
            stats.invalid += batch.discarded as u64;
            stats.errors += batch.failed as u64;
            batch.records
        }
    }
}

#[async_trait]
impl<S: OpportunityStore + 'static> JobRunner for SourceProcessor<S> {
    async fn run(&self, job: &SourceJob) -> Result<JobReport, ProcessError> {
        self.process(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::tests::{unlocated, FixedGeocoder};
    use harvest_adapters::DetailBatch;
    use harvest_core::{CompanyFailureNotice, Coordinates, RawRecord};
    use harvest_storage::{MemoryOpportunityStore, StoreError};
    use std::sync::Arc;

    struct FixedAdapter {
        kind: JobKind,
        harvest: Option<Harvest>,
    }

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn harvest(&self, _job: &SourceJob) -> Result<Harvest, AdapterError> {
            self.harvest
                .clone()
                .ok_or_else(|| AdapterError::Message("listing unreachable".into()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl OpportunityStore for BrokenStore {
        async fn insert_batch(&self, _records: &[CandidateRecord]) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Message("connection reset".into()))
        }
    }

    fn located(id: &str) -> CandidateRecord {
        let mut record = unlocated(id);
        record.coordinates = Some(Coordinates::new(43.52, 5.45));
        record
    }

    fn assembled(records: Vec<CandidateRecord>, failed: usize, discarded: usize) -> Harvest {
        Harvest::Assembled(DetailBatch {
            records,
            failed,
            discarded,
        })
    }

    fn job() -> SourceJob {
        SourceJob::new(JobKind::Auction, "13", NaiveDate::from_ymd_opt(2026, 6, 1).unwrap())
    }

    fn processor<S: OpportunityStore>(harvest: Option<Harvest>, enricher: Enricher, store: S) -> SourceProcessor<S> {
        let adapter = FixedAdapter {
            kind: JobKind::Auction,
            harvest,
        };
        SourceProcessor::new(Box::new(adapter), enricher, ArchiveWriter::new(store))
    }

    #[tokio::test]
    async fn completed_job_reports_every_counter() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let harvest = assembled(vec![located("1"), located("2"), unlocated("3")], 1, 1);
        let processor = processor(Some(harvest), Enricher::disabled(), Arc::clone(&store));

        let report = processor.process(&job()).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.stats.fetched, 5);
        assert_eq!(report.stats.valid, 2);
        assert_eq!(report.stats.invalid, 2);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn enrichment_rescues_records_without_coordinates() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let enricher = Enricher::new(Some(Arc::new(FixedGeocoder::located(43.5, 5.4))), None, 0.7);
        let processor = processor(Some(assembled(vec![unlocated("1")], 0, 0)), enricher, Arc::clone(&store));

        let report = processor.process(&job()).await.unwrap();
        assert_eq!(report.stats.enriched, 1);
        assert_eq!(report.stats.inserted, 1);
    }

    #[tokio::test]
    async fn rerunning_a_job_skips_duplicates() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let processor = processor(Some(assembled(vec![located("1")], 0, 0)), Enricher::disabled(), Arc::clone(&store));

        processor.process(&job()).await.unwrap();
        let second = processor.process(&job()).await.unwrap();
        assert_eq!(second.stats.inserted, 0);
        assert_eq!(second.stats.duplicates_skipped, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_a_failed_job() {
        let processor = processor(None, Enricher::disabled(), MemoryOpportunityStore::new());
        let err = processor.process(&job()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Fetch { .. }));
        assert_eq!(err.outcome(), JobOutcome::Failed);
        assert_eq!(err.stats().errors, 1);
    }

    #[tokio::test]
    async fn persist_failure_after_useful_work_is_degraded() {
        let processor = processor(Some(assembled(vec![located("1")], 0, 0)), Enricher::disabled(), BrokenStore);
        let err = processor.process(&job()).await.unwrap_err();
        assert_eq!(err.outcome(), JobOutcome::Degraded);
        assert_eq!(err.stats().fetched, 1);
        assert_eq!(err.stats().inserted, 0);
    }

    #[tokio::test]
    async fn raw_records_without_identity_count_as_invalid() {
        let notice = CompanyFailureNotice {
            id: Some("A-1".into()),
            ..CompanyFailureNotice::default()
        };
        let adapter = FixedAdapter {
            kind: JobKind::CompanyFailure,
            harvest: Some(Harvest::Raw(vec![RawRecord::CompanyFailure(notice)])),
        };
        let processor = SourceProcessor::new(
            Box::new(adapter),
            Enricher::disabled(),
            ArchiveWriter::new(MemoryOpportunityStore::new()),
        );
        let job = SourceJob::new(JobKind::CompanyFailure, "44", NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());

        let report = processor.process(&job).await.unwrap();
        assert_eq!(report.stats.fetched, 1);
        assert_eq!(report.stats.invalid, 1);
        assert_eq!(report.stats.valid, 0);
        assert_eq!(report.outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn jobs_for_another_kind_are_refused() {
        let processor = processor(Some(assembled(vec![], 0, 0)), Enricher::disabled(), MemoryOpportunityStore::new());
        let other = SourceJob::new(JobKind::Listing, "13", NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());
        assert!(matches!(
            processor.process(&other).await,
            Err(ProcessError::KindMismatch { .. })
        ));
    }
}
