//! Source adapter contracts plus the scraped and open-data adapter implementations.

mod api;
#[cfg(feature = "browser")]
mod browser;
mod detail;
mod extract;
mod page;
mod pagination;
mod scraped;

use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{JobKind, RawRecord, SourceJob};
use harvest_storage::{FetchError, RateLimitedClient};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use api::{CompanyApiSettings, CompanyFailureAdapter, EnergyApiSettings, EnergyDiagnosticAdapter};
#[cfg(feature = "browser")]
pub use browser::{ChromiumPage, ChromiumPageFactory, ChromiumSession};
pub use detail::{DetailBatch, DetailConfig, DetailError, DetailFetcher};
pub use extract::{parse_price, DetailExtractor, SelectorExtractor, SelectorSet};
pub use page::{extract_links, ListingPage, PageError, PageFactory, StaticListingPage, StaticPageFactory};
pub use pagination::{PaginatedExtractor, PaginationConfig};
pub use scraped::{ScrapeSettings, ScrapedSourceAdapter};

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("invalid id pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid url `{url}`: {reason}")]
    Url { url: String, reason: String },
    #[error("{0}")]
    Message(String),
}

/// What a source hands to the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Harvest {
    /// Source-shaped records still to be transformed.
    Raw(Vec<RawRecord>),
    /// Records already assembled from detail pages.
    Assembled(DetailBatch),
}

impl Harvest {
    pub fn fetched(&self) -> usize {
        match self {
            Harvest::Raw(records) => records.len(),
            Harvest::Assembled(batch) => batch.attempted(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Fetch everything the job's partition and window select. Errors are fatal for the job.
    async fn harvest(&self, job: &SourceJob) -> Result<Harvest, AdapterError>;
}

/// How one source kind is reached, as declared in the source registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdapterSettings {
    Scrape(ScrapeSettings),
    EnergyApi(EnergyApiSettings),
    CompanyApi(CompanyApiSettings),
}

impl AdapterSettings {
    pub fn mode(&self) -> &'static str {
        match self {
            AdapterSettings::Scrape(_) => "scrape",
            AdapterSettings::EnergyApi(_) => "energy_api",
            AdapterSettings::CompanyApi(_) => "company_api",
        }
    }

    /// Built-in settings for the open-data kinds; scraped kinds need a site.
    pub fn default_for(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::EnergyDiagnostic => Some(AdapterSettings::EnergyApi(EnergyApiSettings::default())),
            JobKind::CompanyFailure => Some(AdapterSettings::CompanyApi(CompanyApiSettings::default())),
            JobKind::Listing | JobKind::Auction => None,
        }
    }
}

pub async fn page_factory(
    settings: &ScrapeSettings,
    client: Arc<RateLimitedClient>,
) -> Result<Arc<dyn PageFactory>, AdapterError> {
    if !settings.browser {
        return Ok(Arc::new(StaticPageFactory::new(client, settings.page_param.clone())));
    }
    launch_browser(settings, client).await
}

#[cfg(feature = "browser")]
async fn launch_browser(
    settings: &ScrapeSettings,
    client: Arc<RateLimitedClient>,
) -> Result<Arc<dyn PageFactory>, AdapterError> {
    let session = ChromiumSession::launch(!settings.headed).await?;
    let navigation_timeout = std::time::Duration::from_millis(settings.ready_timeout_ms.max(30_000));
    Ok(Arc::new(ChromiumPageFactory::new(session, client, navigation_timeout)))
}

#[cfg(not(feature = "browser"))]
async fn launch_browser(
    _settings: &ScrapeSettings,
    _client: Arc<RateLimitedClient>,
) -> Result<Arc<dyn PageFactory>, AdapterError> {
    Err(AdapterError::Message(
        "browser rendering needs the `browser` cargo feature".into(),
    ))
}

pub async fn adapter_for_source(
    kind: JobKind,
    settings: &AdapterSettings,
    client: Arc<RateLimitedClient>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match (kind, settings) {
        (JobKind::Listing | JobKind::Auction, AdapterSettings::Scrape(scrape)) => {
            let pages = page_factory(scrape, Arc::clone(&client)).await?;
            Ok(Box::new(ScrapedSourceAdapter::new(kind, scrape.clone(), pages)?))
        }
        (JobKind::EnergyDiagnostic, AdapterSettings::EnergyApi(api)) => {
            Ok(Box::new(EnergyDiagnosticAdapter::new(client, api.clone())))
        }
        (JobKind::CompanyFailure, AdapterSettings::CompanyApi(api)) => {
            Ok(Box::new(CompanyFailureAdapter::new(client, api.clone())))
        }
        (kind, other) => Err(AdapterError::Message(format!(
            "{kind} sources cannot use `{}` settings",
            other.mode()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_storage::ClientConfig;

    fn client() -> Arc<RateLimitedClient> {
        Arc::new(RateLimitedClient::new(ClientConfig::default()).unwrap())
    }

    #[test]
    fn settings_are_tagged_by_mode() {
        let raw = serde_json::json!({
            "mode": "scrape",
            "landing_url": "https://annonces.example/vente/{partition}",
            "link_selector": "a.card"
        });
        let settings: AdapterSettings = serde_json::from_value(raw).unwrap();
        let AdapterSettings::Scrape(scrape) = settings else {
            panic!("expected scrape settings");
        };
        assert_eq!(scrape.stagnation_limit, 2);
        assert_eq!(scrape.page_param, "page");
        assert!(!scrape.browser);
    }

    #[tokio::test]
    async fn factory_matches_kind_to_settings() {
        let energy = AdapterSettings::default_for(JobKind::EnergyDiagnostic).unwrap();
        let adapter = adapter_for_source(JobKind::EnergyDiagnostic, &energy, client())
            .await
            .unwrap();
        assert_eq!(adapter.kind(), JobKind::EnergyDiagnostic);

        let mismatch = adapter_for_source(JobKind::CompanyFailure, &energy, client()).await;
        assert!(matches!(mismatch, Err(AdapterError::Message(_))));

        let scrape = AdapterSettings::Scrape(ScrapeSettings::new("https://ventes.test/{partition}", "a"));
        let adapter = adapter_for_source(JobKind::Auction, &scrape, client()).await.unwrap();
        assert_eq!(adapter.kind(), JobKind::Auction);
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn browser_sources_need_the_feature() {
        let mut scrape = ScrapeSettings::new("https://annonces.test/{partition}", "a");
        scrape.browser = true;
        assert!(page_factory(&scrape, client()).await.is_err());
    }
}
