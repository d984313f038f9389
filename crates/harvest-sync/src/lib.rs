//! Job orchestration: source registry, fan-out, per-kind queues and the job processor.

mod config;
mod enrich;
mod processor;
mod queue;
mod schedule;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use harvest_adapters::adapter_for_source;
use harvest_core::{JobKind, SourceJob};
use harvest_storage::{
    AddressApiGeocoder, AddressRefiner, ArchiveWriter, ChatCompletionRefiner, GeocodingService,
    OpportunityStore, RateLimitedClient, RetryConfig,
};
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{EnrichmentSettings, SourceConfig, SourceRegistry, SyncConfig};
pub use enrich::{EnrichOutcome, Enricher};
pub use processor::{JobOutcome, JobReport, JobRunner, PhaseTimings, ProcessError, SourceProcessor};
pub use queue::{FinishedJob, JobQueue, JobSink, QueueError, QueueSet};
pub use schedule::{build_scheduler, job_for, FanOut, FanOutSummary};

pub const CRATE_NAME: &str = "harvest-sync";

const GEOCODER_MIN_INTERVAL: Duration = Duration::from_millis(25);
const REFINER_MIN_INTERVAL: Duration = Duration::from_millis(200);

pub type SharedStore = Arc<dyn OpportunityStore>;

/// Enrichment clients shared by every processor so each external
/// dependency keeps a single throttle across all source kinds.
#[derive(Default)]
struct SharedServices {
    geocoder: Option<Arc<dyn GeocodingService>>,
    refiner: Option<Arc<dyn AddressRefiner>>,
}

impl SharedServices {
    fn build(config: &SyncConfig, registry: &SourceRegistry) -> Result<Self> {
        let mut services = Self::default();
        if registry.sources.iter().any(|s| s.enrichment.geocode) {
            let client = RateLimitedClient::new(config.client_config(
                "geocoder",
                GEOCODER_MIN_INTERVAL,
                RetryConfig::default(),
            ))
            .context("building geocoder client")?;
            services.geocoder = Some(Arc::new(AddressApiGeocoder::new(client, config.geocoder_url.clone())));
        }
        if let Some(endpoint) = &config.llm_url {
            let client = RateLimitedClient::new(config.client_config(
                "refiner",
                REFINER_MIN_INTERVAL,
                RetryConfig::default(),
            ))
            .context("building refiner client")?;
            services.refiner = Some(Arc::new(ChatCompletionRefiner::new(
                client,
                endpoint.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
            )));
        }
        Ok(services)
    }
}

/// Wires sources, enrichment services and the store into runnable processors.
pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    store: SharedStore,
    services: SharedServices,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry, store: SharedStore) -> Result<Self> {
        let services = SharedServices::build(&config, &registry)?;
        Ok(Self {
            config,
            registry,
            store,
            services,
        })
    }

    /// Read the source registry named by the config.
    pub async fn load(config: SyncConfig, store: SharedStore) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        Self::new(config, registry, store)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn source(&self, kind: JobKind) -> Result<&SourceConfig> {
        self.registry
            .get(kind)
            .with_context(|| format!("no source configured for {kind}"))
    }

    /// A one-off job with the source's policies and filters.
    pub fn job(&self, kind: JobKind, partition: &str, since: NaiveDate, before: Option<NaiveDate>) -> Result<SourceJob> {
        Ok(job_for(self.source(kind)?, partition, since, before))
    }

    pub fn fan_out(&self) -> FanOut {
        FanOut::new(self.registry.clone(), self.config.lookback_days)
    }

    fn enricher_for(&self, source: &SourceConfig) -> Enricher {
        let settings = &source.enrichment;
        let geocoder = settings.geocode.then(|| self.services.geocoder.clone()).flatten();
        let refiner = if settings.refine {
            if self.services.refiner.is_none() {
                warn!(kind = %source.kind, "address refinement enabled but HARVEST_LLM_URL is unset");
            }
            self.services.refiner.clone()
        } else {
            None
        };
        Enricher::new(geocoder, refiner, settings.min_refine_confidence)
    }

    pub async fn processor(&self, kind: JobKind) -> Result<SourceProcessor<SharedStore>> {
        let source = self.source(kind)?;
        let client = RateLimitedClient::new(self.config.client_config(
            source.name(),
            source.min_interval(),
            source.client_retry(),
        ))
        .with_context(|| format!("building http client for {kind}"))?;
        let adapter = adapter_for_source(kind, &source.adapter_settings()?, Arc::new(client))
            .await
            .with_context(|| format!("building adapter for {kind}"))?;
        let writer = ArchiveWriter::new(Arc::clone(&self.store)).with_batch_size(self.config.batch_size);
        Ok(SourceProcessor::new(adapter, self.enricher_for(source), writer))
    }

    /// Run one job in the foreground; persistence failures are returned as errors.
    pub async fn run_once(&self, job: &SourceJob) -> Result<JobReport> {
        let processor = self.processor(job.kind).await?;
        Ok(processor.process(job).await?)
    }

    /// One queue per enabled source kind, each with its own workers.
    pub async fn start_queues(&self, concurrency: usize, cancel: CancellationToken) -> Result<QueueSet> {
        let mut queues = QueueSet::new();
        for source in self.registry.enabled() {
            let runner: Arc<dyn JobRunner> = Arc::new(self.processor(source.kind).await?);
            queues.insert(JobQueue::start(source.kind, runner, concurrency, cancel.clone()));
            info!(kind = %source.kind, concurrency, "queue started");
        }
        Ok(queues)
    }

    pub async fn scheduler(&self, sink: Arc<dyn JobSink>) -> Result<JobScheduler> {
        build_scheduler(&self.config.scheduler_cron, Arc::new(self.fan_out()), sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::tests::unlocated;
    use harvest_core::ProcessingStats;
    use harvest_storage::MemoryOpportunityStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const REGISTRY: &str = r#"
sources:
  - kind: company_failure
    partitions: ["44"]
    job_retry:
      max_attempts: 5
      backoff:
        type: fixed
        delay_ms: 10
    filters:
      typeavis: jugement
"#;

    fn pipeline() -> SyncPipeline {
        let config = SyncConfig::from_lookup(|_| None);
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        SyncPipeline::new(config, registry, Arc::new(MemoryOpportunityStore::new())).unwrap()
    }

    #[test]
    fn one_off_jobs_carry_source_policies() {
        let since = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let job = pipeline().job(JobKind::CompanyFailure, "44", since, None).unwrap();
        assert_eq!(job.retry.max_attempts, 5);
        assert_eq!(job.extra_filters.get("typeavis").map(String::as_str), Some("jugement"));
    }

    #[tokio::test]
    async fn unknown_kinds_have_no_processor() {
        assert!(pipeline().processor(JobKind::Listing).await.is_err());
        assert!(pipeline().processor(JobKind::CompanyFailure).await.is_ok());
    }

    struct Stamped(Arc<std::sync::Mutex<Vec<std::time::Instant>>>);

    impl Respond for Stamped {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.0.lock().unwrap().push(std::time::Instant::now());
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [5.45, 43.52] },
                    "properties": { "label": "13100 Aix-en-Provence", "score": 0.9 }
                }]
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kinds_share_one_geocoder_throttle() {
        let server = MockServer::start().await;
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .and(path("/search/"))
            .respond_with(Stamped(Arc::clone(&calls)))
            .mount(&server)
            .await;

        let registry = SourceRegistry::from_yaml(
            "sources:\n  - kind: energy_diagnostic\n    partitions: [\"13\"]\n  - kind: company_failure\n    partitions: [\"13\"]\n",
        )
        .unwrap();
        let config = SyncConfig {
            geocoder_url: server.uri(),
            ..SyncConfig::from_lookup(|_| None)
        };
        let pipeline = SyncPipeline::new(config, registry, Arc::new(MemoryOpportunityStore::new())).unwrap();
        let energy = pipeline.enricher_for(pipeline.source(JobKind::EnergyDiagnostic).unwrap());
        let company = pipeline.enricher_for(pipeline.source(JobKind::CompanyFailure).unwrap());

        let batch = |prefix: &str| (0..8).map(|i| unlocated(&format!("{prefix}-{i}"))).collect::<Vec<_>>();
        let (mut a, mut b) = (ProcessingStats::default(), ProcessingStats::default());
        tokio::join!(
            energy.enrich_all(batch("dpe"), &mut a),
            company.enrich_all(batch("bodacc"), &mut b),
        );
        assert_eq!(a.enriched + b.enriched, 16);

        let mut stamps = calls.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 16);
        for pair in stamps.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(20),
                "geocoder calls {:?} apart",
                pair[1] - pair[0]
            );
        }
    }
}
