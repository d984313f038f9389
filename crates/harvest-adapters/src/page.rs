//! Page seam shared by the listing extractor and the detail fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_storage::{FetchError, RateLimitedClient};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("selector `{selector}` not ready after {after:?}")]
    Timeout { selector: String, after: Duration },
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("no document loaded")]
    NotLoaded,
    #[error("page is closed")]
    Closed,
}

/// One navigable page owned by a single job.
#[async_trait]
pub trait ListingPage: Send {
    async fn goto(&mut self, url: &str) -> Result<(), PageError>;

    /// Errors with [`PageError::Timeout`] when `selector` never matches.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration)
        -> Result<(), PageError>;

    /// `Ok(false)` when no element matches.
    async fn click(&mut self, selector: &str) -> Result<bool, PageError>;

    /// Absolute URLs of the currently visible elements matching `selector`, in document order.
    async fn links(&mut self, selector: &str) -> Result<Vec<String>, PageError>;

    /// Triggers the next lazy load (scroll to bottom, next page).
    async fn load_more(&mut self) -> Result<(), PageError>;

    async fn content(&mut self) -> Result<String, PageError>;

    fn current_url(&self) -> Option<&str>;

    async fn close(&mut self) -> Result<(), PageError>;
}

#[async_trait]
pub trait PageFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ListingPage>, PageError>;
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::Selector(selector.to_string()))
}

/// Pulls `href`s matching `selector`, resolved against `base`.
pub fn extract_links(html: &str, selector: &str, base: Option<&Url>) -> Result<Vec<String>, PageError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&sel)
        .filter_map(|node| node.value().attr("href"))
        .filter_map(|href| match base {
            Some(base) => base.join(href.trim()).ok().map(String::from),
            None => Url::parse(href.trim()).ok().map(String::from),
        })
        .collect())
}

fn matches_selector(html: &str, selector: &str) -> Result<bool, PageError> {
    let sel = parse_selector(selector)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

/// HTTP-backed page: "load more" fetches the next `?page=N` and appends it.
pub struct StaticListingPage {
    client: Arc<RateLimitedClient>,
    page_param: String,
    current: Option<Url>,
    current_text: Option<String>,
    documents: Vec<String>,
    next_page: u32,
    exhausted: bool,
    closed: bool,
}

impl StaticListingPage {
    pub fn new(client: Arc<RateLimitedClient>, page_param: impl Into<String>) -> Self {
        Self {
            client,
            page_param: page_param.into(),
            current: None,
            current_text: None,
            documents: Vec::new(),
            next_page: 2,
            exhausted: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), PageError> {
        if self.closed {
            return Err(PageError::Closed);
        }
        Ok(())
    }

    fn next_page_url(&self) -> Option<Url> {
        let mut url = self.current.clone()?;
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != self.page_param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair(&self.page_param, &self.next_page.to_string());
        Some(url)
    }
}

#[async_trait]
impl ListingPage for StaticListingPage {
    async fn goto(&mut self, url: &str) -> Result<(), PageError> {
        self.ensure_open()?;
        let resp = self
            .client
            .get_text(url)
            .await
            .map_err(|source| PageError::Navigation {
                url: url.to_string(),
                source,
            })?;
        self.current = Url::parse(&resp.final_url).ok();
        self.current_text = Some(resp.final_url);
        self.documents = vec![resp.body];
        self.next_page = 2;
        self.exhausted = false;
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), PageError> {
        self.ensure_open()?;
        let html = self.documents.last().ok_or(PageError::NotLoaded)?;
        if matches_selector(html, selector)? {
            Ok(())
        } else {
            Err(PageError::Timeout {
                selector: selector.to_string(),
                after: timeout,
            })
        }
    }

    async fn click(&mut self, _selector: &str) -> Result<bool, PageError> {
        self.ensure_open()?;
        Ok(false)
    }

    async fn links(&mut self, selector: &str) -> Result<Vec<String>, PageError> {
        self.ensure_open()?;
        let mut out = Vec::new();
        for html in &self.documents {
            out.extend(extract_links(html, selector, self.current.as_ref())?);
        }
        Ok(out)
    }

    async fn load_more(&mut self) -> Result<(), PageError> {
        self.ensure_open()?;
        if self.exhausted {
            return Ok(());
        }
        let Some(url) = self.next_page_url() else {
            return Err(PageError::NotLoaded);
        };
        match self.client.get_text(url.as_str()).await {
            Ok(resp) => {
                self.documents.push(resp.body);
                self.next_page += 1;
                Ok(())
            }
            Err(err) if err.last_status() == Some(404) => {
                debug!(url = %url, "no further listing page");
                self.exhausted = true;
                Ok(())
            }
            Err(source) => Err(PageError::Navigation {
                url: url.to_string(),
                source,
            }),
        }
    }

    async fn content(&mut self) -> Result<String, PageError> {
        self.ensure_open()?;
        self.documents.last().cloned().ok_or(PageError::NotLoaded)
    }

    fn current_url(&self) -> Option<&str> {
        self.current_text.as_deref()
    }

    async fn close(&mut self) -> Result<(), PageError> {
        self.closed = true;
        self.documents.clear();
        Ok(())
    }
}

pub struct StaticPageFactory {
    client: Arc<RateLimitedClient>,
    page_param: String,
}

impl StaticPageFactory {
    pub fn new(client: Arc<RateLimitedClient>, page_param: impl Into<String>) -> Self {
        Self {
            client,
            page_param: page_param.into(),
        }
    }
}

#[async_trait]
impl PageFactory for StaticPageFactory {
    async fn open(&self) -> Result<Box<dyn ListingPage>, PageError> {
        Ok(Box::new(StaticListingPage::new(
            Arc::clone(&self.client),
            self.page_param.clone(),
        )))
    }
}
