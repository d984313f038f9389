//! Open-data API adapters: energy diagnostics (data-fair) and company failures (opendatasoft).

use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{CompanyFailureNotice, EnergyDiagnosticLine, JobKind, RawRecord, SourceJob};
use harvest_storage::RateLimitedClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AdapterError, Harvest, SourceAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyApiSettings {
    pub base_url: String,
    pub dataset: String,
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for EnergyApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://data.ademe.fr".into(),
            dataset: "dpe03existant".into(),
            page_size: 500,
            max_pages: 200,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinesPage {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    results: Vec<EnergyDiagnosticLine>,
    #[serde(default)]
    next: Option<String>,
}

/// Lucene-style query string for one department and date window.
fn energy_query(job: &SourceJob) -> String {
    let upper = job
        .before
        .map(|d| format!("{d}}}"))
        .unwrap_or_else(|| "*]".to_string());
    let mut clauses = vec![
        format!("code_departement_ban:\"{}\"", job.partition_key),
        format!("date_etablissement_dpe:[{} TO {upper}", job.since),
    ];
    clauses.extend(
        job.extra_filters
            .iter()
            .map(|(field, value)| format!("{field}:\"{value}\"")),
    );
    clauses.join(" AND ")
}

/// Follows the `next` cursor until it disappears or a page comes back empty.
pub struct EnergyDiagnosticAdapter {
    client: Arc<RateLimitedClient>,
    settings: EnergyApiSettings,
}

impl EnergyDiagnosticAdapter {
    pub fn new(client: Arc<RateLimitedClient>, settings: EnergyApiSettings) -> Self {
        Self { client, settings }
    }

    fn lines_url(&self) -> String {
        format!(
            "{}/data-fair/api/v1/datasets/{}/lines",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.dataset
        )
    }
}

#[async_trait]
impl SourceAdapter for EnergyDiagnosticAdapter {
    fn kind(&self) -> JobKind {
        JobKind::EnergyDiagnostic
    }

    async fn harvest(&self, job: &SourceJob) -> Result<Harvest, AdapterError> {
        let first_query = vec![
            ("size".to_string(), self.settings.page_size.to_string()),
            ("qs".to_string(), energy_query(job)),
            ("sort".to_string(), "date_etablissement_dpe".to_string()),
        ];
        let mut url = self.lines_url();
        let mut query = first_query;
        let mut records = Vec::new();
        let mut pages = 0;

        while pages < self.settings.max_pages {
            let page: LinesPage = self.client.get_json(&url, &query).await?;
            pages += 1;
            debug!(page = pages, lines = page.results.len(), total = ?page.total, "energy diagnostic page");
            if page.results.is_empty() {
                break;
            }
            records.extend(page.results.into_iter().map(RawRecord::EnergyDiagnostic));
            match page.next {
                Some(next) if !next.is_empty() && pages >= self.settings.max_pages => {
                    warn!(
                        partition = %job.partition_key,
                        max_pages = self.settings.max_pages,
                        records = records.len(),
                        total = ?page.total,
                        next = %next,
                        "page cap reached, remaining lines not fetched"
                    );
                    break;
                }
                Some(next) if !next.is_empty() => {
                    url = next;
                    query.clear();
                }
                _ => break,
            }
        }

        info!(partition = %job.partition_key, records = records.len(), pages, "energy diagnostics fetched");
        Ok(Harvest::Raw(records))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyApiSettings {
    pub base_url: String,
    pub dataset: String,
    pub page_size: u32,
    /// Offset ceiling imposed by the portal.
    pub max_records: u64,
}

impl Default for CompanyApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://bodacc-datadila.opendatasoft.com".into(),
            dataset: "annonces-commerciales".into(),
            page_size: 100,
            max_records: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordsPage {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    results: Vec<CompanyFailureNotice>,
}

fn company_where_clause(job: &SourceJob) -> String {
    let mut clauses = vec![
        "familleavis=\"collective\"".to_string(),
        format!("numerodepartement=\"{}\"", job.partition_key),
        format!("dateparution>=date'{}'", job.since),
    ];
    if let Some(before) = job.before {
        clauses.push(format!("dateparution<date'{before}'"));
    }
    clauses.extend(
        job.extra_filters
            .iter()
            .map(|(field, value)| format!("{field}=\"{value}\"")),
    );
    clauses.join(" AND ")
}

/// Offset pagination bounded by `min(total_count, max_records)`.
pub struct CompanyFailureAdapter {
    client: Arc<RateLimitedClient>,
    settings: CompanyApiSettings,
}

impl CompanyFailureAdapter {
    pub fn new(client: Arc<RateLimitedClient>, settings: CompanyApiSettings) -> Self {
        Self { client, settings }
    }

    fn records_url(&self) -> String {
        format!(
            "{}/api/explore/v2.1/catalog/datasets/{}/records",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.dataset
        )
    }
}

#[async_trait]
impl SourceAdapter for CompanyFailureAdapter {
    fn kind(&self) -> JobKind {
        JobKind::CompanyFailure
    }

    async fn harvest(&self, job: &SourceJob) -> Result<Harvest, AdapterError> {
        let url = self.records_url();
        let filter = company_where_clause(job);
        let limit = u64::from(self.settings.page_size.max(1));
        let mut offset = 0u64;
        let mut ceiling = self.settings.max_records;
        let mut total_count = 0u64;
        let mut records = Vec::new();

        while offset < ceiling {
            let size = limit.min(ceiling - offset);
            let query = vec![
                ("where".to_string(), filter.clone()),
                ("order_by".to_string(), "dateparution".to_string()),
                ("limit".to_string(), size.to_string()),
                ("offset".to_string(), offset.to_string()),
            ];
            let page: RecordsPage = self.client.get_json(&url, &query).await?;
            total_count = page.total_count;
            ceiling = total_count.min(self.settings.max_records);
            debug!(offset, returned = page.results.len(), total = page.total_count, "company failure page");
            if page.results.is_empty() {
                break;
            }
            offset += page.results.len() as u64;
            records.extend(page.results.into_iter().map(RawRecord::CompanyFailure));
        }
        if offset >= ceiling && total_count > self.settings.max_records {
            warn!(
                partition = %job.partition_key,
                total_count,
                max_records = self.settings.max_records,
                records = records.len(),
                "offset ceiling reached, remaining notices not fetched"
            );
        }

        info!(partition = %job.partition_key, records = records.len(), "company failures fetched");
        Ok(Harvest::Raw(records))
    }
}
