use std::time::Duration;

use chrono::NaiveDate;
use harvest_core::{CandidateRecord, JobKind, RawRecord, ValidationError};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::extract::DetailExtractor;
use crate::page::{ListingPage, PageError};

#[derive(Debug, Clone)]
pub struct DetailConfig {
    pub ready_selector: String,
    /// Clicked when the first readiness wait times out.
    pub consent_selector: Option<String>,
    pub ready_timeout: Duration,
    pub item_delay_min: Duration,
    pub item_delay_max: Duration,
    pub progress_every: usize,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            ready_selector: "h1".into(),
            consent_selector: None,
            ready_timeout: Duration::from_secs(15),
            item_delay_min: Duration::from_secs(2),
            item_delay_max: Duration::from_secs(3),
            progress_every: 10,
        }
    }
}

impl DetailConfig {
    fn item_delay(&self) -> Duration {
        let min = self.item_delay_min.as_millis() as u64;
        let max = self.item_delay_max.as_millis() as u64;
        if max <= min {
            return self.item_delay_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Error)]
pub enum DetailError {
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("record discarded: {0}")]
    Discarded(#[from] ValidationError),
    #[error("{0} sources are not scraped")]
    NotScraped(JobKind),
}

/// Records assembled from detail pages, plus what was lost on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailBatch {
    pub records: Vec<CandidateRecord>,
    /// Items whose navigation or extraction failed.
    pub failed: usize,
    /// Items missing a mandatory field.
    pub discarded: usize,
}

impl DetailBatch {
    pub fn attempted(&self) -> usize {
        self.records.len() + self.failed + self.discarded
    }
}

pub struct DetailFetcher<E> {
    kind: JobKind,
    config: DetailConfig,
    extractor: E,
}

impl<E: DetailExtractor> DetailFetcher<E> {
    pub fn new(kind: JobKind, config: DetailConfig, extractor: E) -> Self {
        Self {
            kind,
            config,
            extractor,
        }
    }

    async fn wait_until_ready(&self, page: &mut dyn ListingPage) -> Result<(), PageError> {
        let ready = &self.config.ready_selector;
        match page.wait_for_selector(ready, self.config.ready_timeout).await {
            Ok(()) => Ok(()),
            Err(PageError::Timeout { .. }) if self.config.consent_selector.is_some() => {
                let consent = self.config.consent_selector.as_deref().unwrap_or_default();
                let dismissed = page.click(consent).await?;
                debug!(consent, dismissed, "readiness timed out, retrying after consent overlay");
                page.wait_for_selector(ready, self.config.ready_timeout).await
            }
            Err(err) => Err(err),
        }
    }

    /// `observed_on` dates records whose page carries no event date.
    pub async fn fetch_one(
        &self,
        page: &mut dyn ListingPage,
        url: &str,
        observed_on: NaiveDate,
    ) -> Result<CandidateRecord, DetailError> {
        page.goto(url).await?;
        self.wait_until_ready(page).await?;
        let html = page.content().await?;

        let scraped = self.extractor.extract(url, &html);
        let raw = RawRecord::scraped(self.kind, scraped).ok_or(DetailError::NotScraped(self.kind))?;
        Ok(CandidateRecord::from_raw(raw, observed_on)?)
    }

    /// Never fails as a whole: bad items are counted and skipped.
    pub async fn fetch_all(
        &self,
        page: &mut dyn ListingPage,
        urls: &[String],
        observed_on: NaiveDate,
    ) -> DetailBatch {
        let mut batch = DetailBatch::default();
        let total = urls.len();

        for (index, url) in urls.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.item_delay()).await;
            }
            match self.fetch_one(page, url, observed_on).await {
                Ok(record) => batch.records.push(record),
                Err(DetailError::Discarded(reason)) => {
                    debug!(url = %url, %reason, "detail discarded");
                    batch.discarded += 1;
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "detail fetch failed");
                    batch.failed += 1;
                }
            }

            let processed = index + 1;
            if self.config.progress_every > 0 && processed % self.config.progress_every == 0 {
                info!(
                    kind = %self.kind,
                    processed,
                    total,
                    kept = batch.records.len(),
                    "detail progress"
                );
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{SelectorExtractor, SelectorSet};
    use async_trait::async_trait;
    use harvest_storage::FetchError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeDetailPage {
        pages: HashMap<String, String>,
        current: Option<String>,
        consent_required: bool,
        consent_clicked: bool,
    }

    #[async_trait]
    impl ListingPage for FakeDetailPage {
        async fn goto(&mut self, url: &str) -> Result<(), PageError> {
            if !self.pages.contains_key(url) {
                return Err(PageError::Navigation {
                    url: url.to_string(),
                    source: FetchError::Exhausted {
                        attempts: 3,
                        last: harvest_storage::AttemptError::Status {
                            status: 500,
                            url: url.to_string(),
                        },
                    },
                });
            }
            self.current = Some(url.to_string());
            Ok(())
        }

        async fn wait_for_selector(&mut self, selector: &str, after: Duration) -> Result<(), PageError> {
            if self.consent_required && !self.consent_clicked {
                return Err(PageError::Timeout {
                    selector: selector.to_string(),
                    after,
                });
            }
            Ok(())
        }

        async fn click(&mut self, _selector: &str) -> Result<bool, PageError> {
            self.consent_clicked = true;
            Ok(true)
        }

        async fn links(&mut self, _selector: &str) -> Result<Vec<String>, PageError> {
            Ok(Vec::new())
        }

        async fn load_more(&mut self) -> Result<(), PageError> {
            Ok(())
        }

        async fn content(&mut self) -> Result<String, PageError> {
            let url = self.current.as_ref().ok_or(PageError::NotLoaded)?;
            self.pages.get(url).cloned().ok_or(PageError::NotLoaded)
        }

        fn current_url(&self) -> Option<&str> {
            self.current.as_deref()
        }

        async fn close(&mut self) -> Result<(), PageError> {
            Ok(())
        }
    }

    fn detail_html(id: usize) -> String {
        format!(
            r#"<div data-listing-id="{id}"></div><h1>Maison {id}</h1><p class="address">{id} route de Vienne 69008 Lyon</p>"#
        )
    }

    fn fetcher(config: DetailConfig) -> DetailFetcher<SelectorExtractor> {
        let extractor = SelectorExtractor::new(SelectorSet::listing()).unwrap();
        DetailFetcher::new(JobKind::Listing, config, extractor)
    }

    fn may_4() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 4).unwrap()
    }

    fn instant() -> DetailConfig {
        DetailConfig {
            item_delay_min: Duration::ZERO,
            item_delay_max: Duration::ZERO,
            ready_timeout: Duration::from_millis(10),
            ..DetailConfig::default()
        }
    }

    #[tokio::test]
    async fn failing_items_are_isolated() {
        let urls: Vec<String> = (1..=6).map(|i| format!("https://annonces.test/{i}")).collect();
        let mut page = FakeDetailPage::default();
        for (i, url) in urls.iter().enumerate() {
            let id = i + 1;
            if id == 2 {
                continue;
            }
            let html = if id == 5 {
                "<h1>Sans adresse</h1>".to_string()
            } else {
                detail_html(id)
            };
            page.pages.insert(url.clone(), html);
        }

        let batch = fetcher(instant()).fetch_all(&mut page, &urls, may_4()).await;
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.discarded, 1);
        assert_eq!(batch.attempted(), 6);
        assert_eq!(batch.records[0].qualified_external_id(), "listing:1");
    }

    #[tokio::test]
    async fn consent_overlay_is_dismissed_when_readiness_times_out() {
        let url = "https://annonces.test/77".to_string();
        let mut page = FakeDetailPage {
            consent_required: true,
            ..Default::default()
        };
        page.pages.insert(url.clone(), detail_html(77));

        let config = DetailConfig {
            consent_selector: Some("#accept".into()),
            ..instant()
        };
        let record = fetcher(config).fetch_one(&mut page, &url, may_4()).await.unwrap();
        assert!(page.consent_clicked);
        assert_eq!(record.label, "Maison 77");
    }

    #[tokio::test]
    async fn readiness_timeout_without_consent_fallback_fails_the_item() {
        let url = "https://annonces.test/78".to_string();
        let mut page = FakeDetailPage {
            consent_required: true,
            ..Default::default()
        };
        page.pages.insert(url.clone(), detail_html(78));

        let err = fetcher(instant()).fetch_one(&mut page, &url, may_4()).await.unwrap_err();
        assert!(matches!(err, DetailError::Page(PageError::Timeout { .. })));
    }

    #[tokio::test]
    async fn undated_pages_take_the_date_of_each_run() {
        let urls = vec!["https://annonces.test/9".to_string()];
        let mut page = FakeDetailPage::default();
        page.pages.insert(urls[0].clone(), detail_html(9));
        let fetcher = fetcher(instant());

        let first = fetcher.fetch_all(&mut page, &urls, may_4()).await;
        let later = NaiveDate::from_ymd_opt(2026, 5, 7).unwrap();
        let second = fetcher.fetch_all(&mut page, &urls, later).await;

        assert_eq!(first.records[0].opportunity_date, may_4());
        assert_eq!(second.records[0].opportunity_date, later);
    }
}
