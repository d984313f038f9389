use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use harvest_core::{JobKind, SourceJob};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use url::Url;

use crate::detail::{DetailConfig, DetailFetcher};
use crate::extract::{SelectorExtractor, SelectorSet};
use crate::page::{ListingPage, PageFactory};
use crate::pagination::{PaginatedExtractor, PaginationConfig};
use crate::{AdapterError, Harvest, SourceAdapter};

fn default_page_param() -> String {
    "page".into()
}

/// Per-site settings for listing/detail scraping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSettings {
    /// `{partition}` is replaced by the job's partition key.
    pub landing_url: String,
    pub link_selector: String,
    #[serde(default)]
    pub selectors: Option<SelectorSet>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default)]
    pub browser: bool,
    #[serde(default)]
    pub headed: bool,
    #[serde(default = "ScrapeSettings::default_stagnation")]
    pub stagnation_limit: u32,
    #[serde(default = "ScrapeSettings::default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "ScrapeSettings::default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "ScrapeSettings::default_settle_jitter_ms")]
    pub settle_jitter_ms: u64,
    #[serde(default = "ScrapeSettings::default_detail_delay_min_ms")]
    pub detail_delay_min_ms: u64,
    #[serde(default = "ScrapeSettings::default_detail_delay_max_ms")]
    pub detail_delay_max_ms: u64,
    #[serde(default = "ScrapeSettings::default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "ScrapeSettings::default_progress_every")]
    pub progress_every: usize,
}

impl ScrapeSettings {
    fn default_stagnation() -> u32 {
        2
    }
    fn default_max_iterations() -> u32 {
        200
    }
    fn default_settle_ms() -> u64 {
        1500
    }
    fn default_settle_jitter_ms() -> u64 {
        1000
    }
    fn default_detail_delay_min_ms() -> u64 {
        2000
    }
    fn default_detail_delay_max_ms() -> u64 {
        3000
    }
    fn default_ready_timeout_ms() -> u64 {
        15_000
    }
    fn default_progress_every() -> usize {
        10
    }

    pub fn new(landing_url: impl Into<String>, link_selector: impl Into<String>) -> Self {
        Self {
            landing_url: landing_url.into(),
            link_selector: link_selector.into(),
            selectors: None,
            page_param: default_page_param(),
            browser: false,
            headed: false,
            stagnation_limit: Self::default_stagnation(),
            max_iterations: Self::default_max_iterations(),
            settle_ms: Self::default_settle_ms(),
            settle_jitter_ms: Self::default_settle_jitter_ms(),
            detail_delay_min_ms: Self::default_detail_delay_min_ms(),
            detail_delay_max_ms: Self::default_detail_delay_max_ms(),
            ready_timeout_ms: Self::default_ready_timeout_ms(),
            progress_every: Self::default_progress_every(),
        }
    }

    fn selector_set(&self, kind: JobKind) -> SelectorSet {
        self.selectors.clone().unwrap_or_else(|| match kind {
            JobKind::Auction => SelectorSet::auction(),
            _ => SelectorSet::listing(),
        })
    }

    fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            link_selector: self.link_selector.clone(),
            stagnation_limit: self.stagnation_limit,
            max_iterations: self.max_iterations,
            settle_base: Duration::from_millis(self.settle_ms),
            settle_jitter: Duration::from_millis(self.settle_jitter_ms),
        }
    }
}

/// Listing crawl followed by per-item detail scraping on one owned page.
pub struct ScrapedSourceAdapter {
    kind: JobKind,
    settings: ScrapeSettings,
    pages: Arc<dyn PageFactory>,
    listing: PaginatedExtractor,
    details: DetailFetcher<SelectorExtractor>,
}

impl ScrapedSourceAdapter {
    pub fn new(
        kind: JobKind,
        settings: ScrapeSettings,
        pages: Arc<dyn PageFactory>,
    ) -> Result<Self, AdapterError> {
        if !matches!(kind, JobKind::Listing | JobKind::Auction) {
            return Err(AdapterError::Message(format!("{kind} sources are not scraped")));
        }
        let selectors = settings.selector_set(kind);
        let detail_config = DetailConfig {
            ready_selector: selectors.ready.clone(),
            consent_selector: selectors.consent_button.clone(),
            ready_timeout: Duration::from_millis(settings.ready_timeout_ms),
            item_delay_min: Duration::from_millis(settings.detail_delay_min_ms),
            item_delay_max: Duration::from_millis(settings.detail_delay_max_ms),
            progress_every: settings.progress_every,
        };
        let details = DetailFetcher::new(kind, detail_config, SelectorExtractor::new(selectors)?);
        Ok(Self {
            kind,
            listing: PaginatedExtractor::new(settings.pagination()),
            settings,
            pages,
            details,
        })
    }

    /// Landing URL for a job: partition substituted, extra filters appended as query pairs.
    pub fn landing_url(&self, job: &SourceJob) -> Result<String, AdapterError> {
        let raw = self.settings.landing_url.replace("{partition}", &job.partition_key);
        let mut url = Url::parse(&raw).map_err(|err| AdapterError::Url {
            url: raw.clone(),
            reason: err.to_string(),
        })?;
        if !job.extra_filters.is_empty() {
            url.query_pairs_mut().extend_pairs(job.extra_filters.iter());
        }
        Ok(url.into())
    }

    async fn crawl(
        &self,
        page: &mut dyn ListingPage,
        job: &SourceJob,
        observed_on: NaiveDate,
    ) -> Result<Harvest, AdapterError> {
        let landing = self.landing_url(job)?;
        let links = self
            .listing
            .extract_all_with_pagination(page, &landing)
            .await?;
        let batch = self.details.fetch_all(page, &links, observed_on).await;
        info!(
            kind = %self.kind,
            partition = %job.partition_key,
            links = links.len(),
            kept = batch.records.len(),
            failed = batch.failed,
            discarded = batch.discarded,
            "scrape finished"
        );
        Ok(Harvest::Assembled(batch))
    }
}

#[async_trait]
impl SourceAdapter for ScrapedSourceAdapter {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn harvest(&self, job: &SourceJob) -> Result<Harvest, AdapterError> {
        let observed_on = Utc::now().date_naive();
        let mut page = self.pages.open().await?;
        let span = info_span!("scrape", kind = %self.kind, partition = %job.partition_key);
        let result = self.crawl(page.as_mut(), job, observed_on).instrument(span).await;
        if let Err(err) = page.close().await {
            warn!(kind = %self.kind, error = %err, "page close failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageError;
    use crate::pagination::tests::ScriptedListing;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail_links: bool,
    }

    struct TrackedPage {
        inner: ScriptedListing,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ListingPage for TrackedPage {
        async fn goto(&mut self, url: &str) -> Result<(), PageError> {
            self.inner.goto(url).await
        }
        async fn wait_for_selector(&mut self, s: &str, t: Duration) -> Result<(), PageError> {
            self.inner.wait_for_selector(s, t).await
        }
        async fn click(&mut self, s: &str) -> Result<bool, PageError> {
            self.inner.click(s).await
        }
        async fn links(&mut self, s: &str) -> Result<Vec<String>, PageError> {
            self.inner.links(s).await
        }
        async fn load_more(&mut self) -> Result<(), PageError> {
            self.inner.load_more().await
        }
        async fn content(&mut self) -> Result<String, PageError> {
            Ok("<h1>Lot</h1>".into())
        }
        fn current_url(&self) -> Option<&str> {
            None
        }
        async fn close(&mut self) -> Result<(), PageError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PageFactory for CountingFactory {
        async fn open(&self) -> Result<Box<dyn ListingPage>, PageError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let mut inner = ScriptedListing::new(vec![vec!["https://encheres.test/lot/1"]]);
            inner.fail_links = self.fail_links;
            Ok(Box::new(TrackedPage {
                inner,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn settings() -> ScrapeSettings {
        ScrapeSettings {
            settle_ms: 0,
            settle_jitter_ms: 0,
            detail_delay_min_ms: 0,
            detail_delay_max_ms: 0,
            ..ScrapeSettings::new("https://encheres.test/ventes/{partition}", "a.lot")
        }
    }

    fn job() -> SourceJob {
        SourceJob::new(JobKind::Auction, "13", NaiveDate::from_ymd_opt(2026, 6, 1).unwrap())
            .with_filter("type", "immobilier")
    }

    fn adapter(fail_links: bool) -> (ScrapedSourceAdapter, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            opened: AtomicUsize::new(0),
            closed: Arc::clone(&closed),
            fail_links,
        };
        let adapter = ScrapedSourceAdapter::new(JobKind::Auction, settings(), Arc::new(factory)).unwrap();
        (adapter, closed)
    }

    #[test]
    fn landing_url_substitutes_partition_and_filters() {
        let (adapter, _) = adapter(false);
        assert_eq!(
            adapter.landing_url(&job()).unwrap(),
            "https://encheres.test/ventes/13?type=immobilier"
        );
    }

    #[tokio::test]
    async fn page_is_closed_after_a_successful_harvest() {
        let (adapter, closed) = adapter(false);
        let Harvest::Assembled(batch) = adapter.harvest(&job()).await.unwrap() else {
            panic!("expected assembled records");
        };
        assert_eq!(batch.attempted(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_is_closed_when_the_listing_fails() {
        let (adapter, closed) = adapter(true);
        assert!(adapter.harvest(&job()).await.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn api_kinds_cannot_be_scraped() {
        let factory = CountingFactory {
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_links: false,
        };
        assert!(ScrapedSourceAdapter::new(JobKind::EnergyDiagnostic, settings(), Arc::new(factory)).is_err());
    }
}
