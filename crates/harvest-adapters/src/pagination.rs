use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::page::{ListingPage, PageError};

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub link_selector: String,
    /// Consecutive no-growth iterations that end the harvest.
    pub stagnation_limit: u32,
    pub max_iterations: u32,
    pub settle_base: Duration,
    pub settle_jitter: Duration,
}

impl PaginationConfig {
    pub fn new(link_selector: impl Into<String>) -> Self {
        Self {
            link_selector: link_selector.into(),
            stagnation_limit: 2,
            max_iterations: 200,
            settle_base: Duration::from_millis(1500),
            settle_jitter: Duration::from_millis(1000),
        }
    }

    fn settle_delay(&self) -> Duration {
        let jitter_ms = self.settle_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.settle_base;
        }
        self.settle_base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Harvests every detail link from a lazily loaded listing.
#[derive(Debug, Clone)]
pub struct PaginatedExtractor {
    config: PaginationConfig,
}

impl PaginatedExtractor {
    pub fn new(config: PaginationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Deduplicated links in the last observed page order; links seen earlier
    /// but no longer visible keep their relative order after the visible ones.
    pub async fn extract_all_with_pagination(
        &self,
        page: &mut dyn ListingPage,
        landing_url: &str,
    ) -> Result<Vec<String>, PageError> {
        page.goto(landing_url).await?;

        let mut ordered: Vec<String> = Vec::new();
        let mut previous_len = 0usize;
        let mut stagnation = 0u32;
        let mut iterations = 0u32;

        while iterations < self.config.max_iterations {
            iterations += 1;
            let visible = page.links(&self.config.link_selector).await?;

            let mut seen = HashSet::with_capacity(visible.len() + ordered.len());
            ordered = visible
                .into_iter()
                .chain(std::mem::take(&mut ordered))
                .filter(|link| seen.insert(link.clone()))
                .collect();

            if ordered.len() == previous_len {
                stagnation += 1;
            } else {
                stagnation = 0;
            }
            previous_len = ordered.len();
            debug!(iteration = iterations, links = ordered.len(), stagnation, "listing iteration");

            if stagnation >= self.config.stagnation_limit || iterations >= self.config.max_iterations {
                break;
            }
            page.load_more().await?;
            tokio::time::sleep(self.config.settle_delay()).await;
        }

        info!(
            landing_url,
            links = ordered.len(),
            iterations,
            "listing harvested"
        );
        Ok(ordered)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Page whose listing grows by one round of links per `load_more`.
    pub(crate) struct ScriptedListing {
        pub rounds: Vec<Vec<String>>,
        pub loaded: usize,
        pub link_calls: usize,
        pub fail_links: bool,
        pub closed: bool,
    }

    impl ScriptedListing {
        pub(crate) fn new(rounds: Vec<Vec<&str>>) -> Self {
            Self {
                rounds: rounds
                    .into_iter()
                    .map(|r| r.into_iter().map(String::from).collect())
                    .collect(),
                loaded: 0,
                link_calls: 0,
                fail_links: false,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl ListingPage for ScriptedListing {
        async fn goto(&mut self, _url: &str) -> Result<(), PageError> {
            Ok(())
        }

        async fn wait_for_selector(&mut self, _s: &str, _t: Duration) -> Result<(), PageError> {
            Ok(())
        }

        async fn click(&mut self, _s: &str) -> Result<bool, PageError> {
            Ok(false)
        }

        async fn links(&mut self, _selector: &str) -> Result<Vec<String>, PageError> {
            self.link_calls += 1;
            if self.fail_links {
                return Err(PageError::Browser("renderer crashed".into()));
            }
            let last = self.loaded.min(self.rounds.len().saturating_sub(1));
            Ok(self.rounds.get(last).cloned().unwrap_or_default())
        }

        async fn load_more(&mut self) -> Result<(), PageError> {
            self.loaded += 1;
            Ok(())
        }

        async fn content(&mut self) -> Result<String, PageError> {
            Ok(String::new())
        }

        fn current_url(&self) -> Option<&str> {
            None
        }

        async fn close(&mut self) -> Result<(), PageError> {
            self.closed = true;
            Ok(())
        }
    }

    fn instant_config() -> PaginationConfig {
        PaginationConfig {
            settle_base: Duration::ZERO,
            settle_jitter: Duration::ZERO,
            ..PaginationConfig::new("a.card")
        }
    }

    #[tokio::test]
    async fn stops_after_two_iterations_without_growth() {
        let mut page = ScriptedListing::new(vec![
            vec!["u1"],
            vec!["u1", "u2"],
            vec!["u1", "u2", "u3"],
        ]);
        let extractor = PaginatedExtractor::new(instant_config());
        let links = extractor
            .extract_all_with_pagination(&mut page, "https://listing.test")
            .await
            .unwrap();

        assert_eq!(links, vec!["u1", "u2", "u3"]);
        assert_eq!(page.link_calls, 5);
    }

    #[tokio::test]
    async fn virtualized_listing_keeps_links_that_scrolled_away() {
        let mut page = ScriptedListing::new(vec![
            vec!["u1", "u2"],
            vec!["u2", "u3"],
            vec!["u3", "u4"],
        ]);
        let extractor = PaginatedExtractor::new(instant_config());
        let links = extractor
            .extract_all_with_pagination(&mut page, "https://listing.test")
            .await
            .unwrap();

        assert_eq!(links, vec!["u3", "u4", "u2", "u1"]);
    }

    #[tokio::test]
    async fn hard_cap_bounds_an_ever_growing_listing() {
        let rounds: Vec<Vec<String>> = (1..=50)
            .map(|n| (0..n).map(|i| format!("u{i}")).collect())
            .collect();
        let mut page = ScriptedListing {
            rounds,
            loaded: 0,
            link_calls: 0,
            fail_links: false,
            closed: false,
        };
        let extractor = PaginatedExtractor::new(PaginationConfig {
            max_iterations: 7,
            ..instant_config()
        });
        let links = extractor
            .extract_all_with_pagination(&mut page, "https://listing.test")
            .await
            .unwrap();

        assert_eq!(page.link_calls, 7);
        assert_eq!(links.len(), 7);
        assert_eq!(page.loaded, 6, "no scroll after the last allowed iteration");
    }

    #[tokio::test]
    async fn extraction_failure_is_fatal() {
        let mut page = ScriptedListing::new(vec![vec!["u1"]]);
        page.fail_links = true;
        let extractor = PaginatedExtractor::new(instant_config());
        assert!(extractor
            .extract_all_with_pagination(&mut page, "https://listing.test")
            .await
            .is_err());
    }
}
