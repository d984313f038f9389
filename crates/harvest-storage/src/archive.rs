use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{CandidateRecord, Opportunity, ValidationError};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Bound parameters per opportunity row in the Postgres insert.
const COLUMNS_PER_ROW: usize = 12;

/// Largest batch that stays under Postgres's 65 535 bind-parameter limit.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / COLUMNS_PER_ROW;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record {external_id} cannot be persisted: {source}")]
    Invalid {
        external_id: String,
        #[source]
        source: ValidationError,
    },
    #[error("{0}")]
    Message(String),
}

/// Insert-or-skip persistence keyed on the qualified external id.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Returns the number of rows actually inserted, or `None` when the
    /// backend cannot report it.
    async fn insert_batch(&self, records: &[CandidateRecord]) -> Result<Option<u64>, StoreError>;
}

#[async_trait]
impl<T: OpportunityStore + ?Sized> OpportunityStore for Arc<T> {
    async fn insert_batch(&self, records: &[CandidateRecord]) -> Result<Option<u64>, StoreError> {
        (**self).insert_batch(records).await
    }
}

/// What to do when a batch insert reports no row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowCountPolicy {
    /// Count the whole batch as inserted.
    #[default]
    AssumeFullBatch,
    /// Fail the write.
    Require,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub batches: usize,
    pub inserted: u64,
    pub duplicates_skipped: u64,
    /// Batches whose count was assumed rather than reported.
    pub assumed_batches: usize,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("batch {batch_index} failed after {} rows were committed: {source}", .partial.inserted)]
    Batch {
        batch_index: usize,
        partial: ArchiveSummary,
        #[source]
        source: StoreError,
    },
    #[error("store reported no row count for batch {batch_index}")]
    MissingRowCount {
        batch_index: usize,
        partial: ArchiveSummary,
    },
}

impl ArchiveError {
    /// Work committed by the batches that succeeded before the failure.
    pub fn partial(&self) -> ArchiveSummary {
        match self {
            ArchiveError::Batch { partial, .. } | ArchiveError::MissingRowCount { partial, .. } => {
                *partial
            }
        }
    }
}

/// Splits validated records into fixed-size batches and writes them in order,
/// aborting on the first failing batch.
#[derive(Debug, Clone)]
pub struct ArchiveWriter<S> {
    store: S,
    batch_size: usize,
    row_counts: RowCountPolicy,
}

impl<S: OpportunityStore> ArchiveWriter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            row_counts: RowCountPolicy::default(),
        }
    }

    /// Clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        if batch_size > MAX_BATCH_SIZE {
            warn!(batch_size, max = MAX_BATCH_SIZE, "batch size clamped to the bind-parameter limit");
        }
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_row_count_policy(mut self, policy: RowCountPolicy) -> Self {
        self.row_counts = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn write(&self, records: &[CandidateRecord]) -> Result<ArchiveSummary, ArchiveError> {
        let mut summary = ArchiveSummary::default();

        for (batch_index, chunk) in records.chunks(self.batch_size).enumerate() {
            let size = chunk.len() as u64;
            let reported = match self.store.insert_batch(chunk).await {
                Ok(reported) => reported,
                Err(source) => {
                    error!(batch_index, size, error = %source, "batch insert failed, aborting remaining batches");
                    return Err(ArchiveError::Batch {
                        batch_index,
                        partial: summary,
                        source,
                    });
                }
            };

            let inserted = match (reported, self.row_counts) {
                (Some(count), _) => count.min(size),
                (None, RowCountPolicy::AssumeFullBatch) => {
                    warn!(batch_index, size, "store reported no row count, assuming full batch");
                    summary.assumed_batches += 1;
                    size
                }
                (None, RowCountPolicy::Require) => {
                    return Err(ArchiveError::MissingRowCount {
                        batch_index,
                        partial: summary,
                    });
                }
            };

            summary.batches += 1;
            summary.inserted += inserted;
            summary.duplicates_skipped += size - inserted;
            debug!(batch_index, size, inserted, "batch persisted");
        }

        Ok(summary)
    }
}

fn to_rows(records: &[CandidateRecord]) -> Result<Vec<Opportunity>, StoreError> {
    records
        .iter()
        .map(|record| {
            Opportunity::from_candidate(record).map_err(|source| StoreError::Invalid {
                external_id: record.qualified_external_id(),
                source,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn insert_batch(&self, records: &[CandidateRecord]) -> Result<Option<u64>, StoreError> {
        if records.is_empty() {
            return Ok(Some(0));
        }
        let rows = to_rows(records)?;

        let mut builder = QueryBuilder::new(
            "INSERT INTO opportunities (id, external_id, opportunity_type, label, address, \
             zip_code, department, latitude, longitude, opportunity_date, payload, created_at) ",
        );
        builder.push_values(rows, |mut row, o| {
            row.push_bind(o.id)
                .push_bind(o.external_id)
                .push_bind(o.opportunity_type.as_str())
                .push_bind(o.label)
                .push_bind(o.address)
                .push_bind(o.zip_code)
                .push_bind(o.department)
                .push_bind(o.latitude)
                .push_bind(o.longitude)
                .push_bind(o.opportunity_date)
                .push_bind(o.payload)
                .push_bind(o.created_at);
        });
        builder.push(" ON CONFLICT (external_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(Some(result.rows_affected()))
    }
}

/// In-process store used for dry runs and tests.
#[derive(Debug)]
pub struct MemoryOpportunityStore {
    rows: Mutex<BTreeMap<String, Opportunity>>,
    batch_sizes: Mutex<Vec<usize>>,
    report_row_counts: bool,
}

impl Default for MemoryOpportunityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            batch_sizes: Mutex::new(Vec::new()),
            report_row_counts: true,
        }
    }

    /// A store that behaves like a backend without affected-row counts.
    pub fn without_row_counts() -> Self {
        Self {
            report_row_counts: false,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.rows
            .lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn insert_batch(&self, records: &[CandidateRecord]) -> Result<Option<u64>, StoreError> {
        let incoming = to_rows(records)?;
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Message("memory store poisoned".into()))?;
        let mut inserted = 0;
        for row in incoming {
            if !rows.contains_key(&row.external_id) {
                rows.insert(row.external_id.clone(), row);
                inserted += 1;
            }
        }
        if let Ok(mut sizes) = self.batch_sizes.lock() {
            sizes.push(records.len());
        }
        Ok(self.report_row_counts.then_some(inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use harvest_core::{Coordinates, JobKind, OpportunityType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn candidate(id: usize) -> CandidateRecord {
        CandidateRecord {
            source: JobKind::Auction,
            external_id: id.to_string(),
            opportunity_type: OpportunityType::Auction,
            label: format!("Lot {id}"),
            address: Some(format!("{id} avenue Jean Jaurès 69007 Lyon")),
            city: Some("Lyon".into()),
            zip_code: Some("69007".into()),
            department: Some("69".into()),
            coordinates: Some(Coordinates::new(45.74, 4.84)),
            opportunity_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            payload: serde_json::json!({}),
            refined_address: None,
            confidence: None,
        }
    }

    fn candidates(n: usize) -> Vec<CandidateRecord> {
        (0..n).map(candidate).collect()
    }

    struct FailingOnBatch {
        fail_at: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OpportunityStore for FailingOnBatch {
        async fn insert_batch(&self, records: &[CandidateRecord]) -> Result<Option<u64>, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_at {
                return Err(StoreError::Message("connection lost".into()));
            }
            Ok(Some(records.len() as u64))
        }
    }

    #[tokio::test]
    async fn records_are_written_in_fixed_size_batches() {
        let writer = ArchiveWriter::new(MemoryOpportunityStore::new());
        let summary = writer.write(&candidates(1200)).await.unwrap();

        assert_eq!(writer.store().batch_sizes(), vec![500, 500, 200]);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.inserted, 1200);
        assert_eq!(summary.duplicates_skipped, 0);
    }

    #[tokio::test]
    async fn oversized_batches_are_clamped_to_the_parameter_limit() {
        let writer = ArchiveWriter::new(MemoryOpportunityStore::new()).with_batch_size(9000);
        writer.write(&candidates(6000)).await.unwrap();

        assert_eq!(MAX_BATCH_SIZE, 5461);
        assert_eq!(writer.store().batch_sizes(), vec![5461, 539]);
    }

    #[tokio::test]
    async fn rewriting_the_same_records_inserts_nothing() {
        let writer = ArchiveWriter::new(MemoryOpportunityStore::new()).with_batch_size(4);
        let records = candidates(10);
        writer.write(&records).await.unwrap();

        let second = writer.write(&records).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates_skipped, 10);
        assert_eq!(writer.store().len(), 10);
    }

    #[tokio::test]
    async fn failing_batch_aborts_the_remaining_ones() {
        let store = FailingOnBatch {
            fail_at: 1,
            calls: AtomicUsize::new(0),
        };
        let writer = ArchiveWriter::new(store);
        let err = writer.write(&candidates(1200)).await.unwrap_err();

        match &err {
            ArchiveError::Batch { batch_index, .. } => assert_eq!(*batch_index, 1),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.partial().inserted, 500);
        assert_eq!(writer.store().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_row_count_is_assumed_full_unless_required() {
        let writer = ArchiveWriter::new(MemoryOpportunityStore::without_row_counts());
        let summary = writer.write(&candidates(3)).await.unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.assumed_batches, 1);

        let strict = ArchiveWriter::new(MemoryOpportunityStore::without_row_counts())
            .with_row_count_policy(RowCountPolicy::Require);
        assert!(matches!(
            strict.write(&candidates(3)).await,
            Err(ArchiveError::MissingRowCount { batch_index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn invalid_record_rejects_its_whole_batch() {
        let mut records = candidates(2);
        records[1].coordinates = None;
        let writer = ArchiveWriter::new(MemoryOpportunityStore::new());

        let err = writer.write(&records).await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Batch {
                source: StoreError::Invalid { .. },
                ..
            }
        ));
        assert!(writer.store().is_empty());
    }
}
