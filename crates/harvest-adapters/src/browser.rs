//! Headless Chromium pages for sites that render listings client-side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use harvest_storage::{AttemptError, RateLimitedClient};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::page::{ListingPage, PageError, PageFactory};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); true";

/// Browser process plus the task driving its CDP event handler.
pub struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl ChromiumSession {
    pub async fn launch(headless: bool) -> Result<Self, PageError> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(PageError::Browser)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PageError::Browser(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        Ok(Self { browser, handler })
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

pub struct ChromiumPageFactory {
    session: ChromiumSession,
    client: Arc<RateLimitedClient>,
    navigation_timeout: Duration,
}

impl ChromiumPageFactory {
    pub fn new(
        session: ChromiumSession,
        client: Arc<RateLimitedClient>,
        navigation_timeout: Duration,
    ) -> Self {
        Self {
            session,
            client,
            navigation_timeout,
        }
    }
}

#[async_trait]
impl PageFactory for ChromiumPageFactory {
    async fn open(&self) -> Result<Box<dyn ListingPage>, PageError> {
        let page = self
            .session
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PageError::Browser(e.to_string()))?;
        Ok(Box::new(ChromiumPage {
            page: Some(page),
            client: Arc::clone(&self.client),
            navigation_timeout: self.navigation_timeout,
            url: None,
        }))
    }
}

/// A CDP page. Navigation goes through the shared retry contract.
pub struct ChromiumPage {
    page: Option<Page>,
    client: Arc<RateLimitedClient>,
    navigation_timeout: Duration,
    url: Option<String>,
}

impl ChromiumPage {
    fn page(&self) -> Result<&Page, PageError> {
        self.page.as_ref().ok_or(PageError::Closed)
    }
}

fn browser_error(err: impl std::fmt::Display) -> PageError {
    PageError::Browser(err.to_string())
}

#[async_trait]
impl ListingPage for ChromiumPage {
    async fn goto(&mut self, url: &str) -> Result<(), PageError> {
        let page = self.page()?;
        let limit = self.navigation_timeout;
        self.client
            .execute(move || async move {
                match timeout(limit, page.goto(url)).await {
                    Err(_) => Err(AttemptError::Timeout(limit)),
                    Ok(Err(err)) => Err(AttemptError::Other(err.to_string())),
                    Ok(Ok(_)) => Ok(()),
                }
            })
            .await
            .map_err(|source| PageError::Navigation {
                url: url.to_string(),
                source,
            })?;
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        limit: Duration,
    ) -> Result<(), PageError> {
        let page = self.page()?;
        let deadline = Instant::now() + limit;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PageError::Timeout {
                    selector: selector.to_string(),
                    after: limit,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&mut self, selector: &str) -> Result<bool, PageError> {
        let page = self.page()?;
        let Ok(element) = page.find_element(selector).await else {
            return Ok(false);
        };
        element.click().await.map_err(browser_error)?;
        Ok(true)
    }

    async fn links(&mut self, selector: &str) -> Result<Vec<String>, PageError> {
        let page = self.page()?;
        let quoted = serde_json::to_string(selector).map_err(browser_error)?;
        let script = format!(
            "Array.from(document.querySelectorAll({quoted})).map(a => a.href).filter(h => !!h)"
        );
        page.evaluate(script)
            .await
            .map_err(browser_error)?
            .into_value::<Vec<String>>()
            .map_err(browser_error)
    }

    async fn load_more(&mut self) -> Result<(), PageError> {
        self.page()?
            .evaluate(SCROLL_SCRIPT)
            .await
            .map_err(browser_error)?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, PageError> {
        self.page()?.content().await.map_err(browser_error)
    }

    fn current_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    async fn close(&mut self) -> Result<(), PageError> {
        if let Some(page) = self.page.take() {
            if let Err(err) = page.close().await {
                warn!(error = %err, "closing browser page failed");
                return Err(browser_error(err));
            }
            debug!(url = self.url.as_deref().unwrap_or(""), "browser page closed");
        }
        Ok(())
    }
}

impl Drop for ChromiumPage {
    /// Closes the tab when a harvest is dropped before `close` ran.
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = page.close().await {
                        warn!(error = %err, "closing dropped browser page failed");
                    }
                });
            }
            Err(_) => warn!("browser page dropped outside a runtime, tab left open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_storage::ClientConfig;

    #[tokio::test]
    #[ignore = "Requires a local Chromium"]
    async fn dropped_page_closes_its_tab() {
        let session = ChromiumSession::launch(true).await.unwrap();
        let client = Arc::new(RateLimitedClient::new(ClientConfig::default()).unwrap());
        let factory = ChromiumPageFactory::new(session, client, Duration::from_secs(10));
        let before = factory.session.browser.pages().await.unwrap().len();

        let page = factory.open().await.unwrap();
        assert_eq!(factory.session.browser.pages().await.unwrap().len(), before + 1);
        drop(page);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(factory.session.browser.pages().await.unwrap().len(), before);
    }
}
