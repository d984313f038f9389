//! Core domain model for the opportunity harvest pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Source family a job harvests from. One queue and one adapter per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Listing,
    Auction,
    EnergyDiagnostic,
    CompanyFailure,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Listing,
        JobKind::Auction,
        JobKind::EnergyDiagnostic,
        JobKind::CompanyFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Listing => "listing",
            JobKind::Auction => "auction",
            JobKind::EnergyDiagnostic => "energy_diagnostic",
            JobKind::CompanyFailure => "company_failure",
        }
    }

    pub fn opportunity_type(&self) -> OpportunityType {
        match self {
            JobKind::Listing => OpportunityType::RealEstateListing,
            JobKind::Auction => OpportunityType::Auction,
            JobKind::EnergyDiagnostic => OpportunityType::EnergySieve,
            JobKind::CompanyFailure => OpportunityType::Liquidation,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown job kind `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityType {
    RealEstateListing,
    Auction,
    EnergySieve,
    Liquidation,
}

impl OpportunityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityType::RealEstateListing => "real_estate_listing",
            OpportunityType::Auction => "auction",
            OpportunityType::EnergySieve => "energy_sieve",
            OpportunityType::Liquidation => "liquidation",
        }
    }
}

/// Delay shape between two attempts of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

/// Queue-level retry policy for a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base_ms: 60_000,
                max_ms: 30 * 60_000,
            },
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (1-based; attempt 1 never waits).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let exponent = next_attempt.saturating_sub(2).min(31);
                let factor = 1u64 << exponent;
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// How many finished job records a queue keeps before dropping the oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 100,
        }
    }
}

/// Unit of fan-out work. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub partition_key: String,
    pub since: NaiveDate,
    #[serde(default)]
    pub before: Option<NaiveDate>,
    #[serde(default)]
    pub extra_filters: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub removal: RemovalPolicy,
    pub created_at: DateTime<Utc>,
}

impl SourceJob {
    pub fn new(kind: JobKind, partition_key: impl Into<String>, since: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            partition_key: partition_key.into(),
            since,
            before: None,
            extra_filters: BTreeMap::new(),
            retry: RetryPolicy::default(),
            removal: RemovalPolicy::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_before(mut self, before: Option<NaiveDate>) -> Self {
        self.before = before;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_filters.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_removal(mut self, removal: RemovalPolicy) -> Self {
        self.removal = removal;
        self
    }

    /// `since` is inclusive, `before` exclusive; an absent `before` is open-ended.
    pub fn window_contains(&self, date: NaiveDate) -> bool {
        date >= self.since && self.before.map_or(true, |before| date < before)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }

    /// Parse a `"lat,lon"` pair as published by the open data portals.
    pub fn parse_pair(text: &str) -> Option<Self> {
        let (lat, lon) = text.split_once(',')?;
        let coords = Self::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?);
        coords.is_valid().then_some(coords)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

/// Fields scraped from one detail page. Every field is optional at this stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub contact: Option<Contact>,
    pub energy_rating: Option<String>,
    pub event_date: Option<String>,
    pub coordinates: Option<Coordinates>,
}

/// One line of the energy performance diagnostic (DPE) open dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyDiagnosticLine {
    #[serde(rename = "numero_dpe", default)]
    pub diagnostic_number: Option<String>,
    #[serde(rename = "adresse_ban", default)]
    pub address: Option<String>,
    #[serde(rename = "code_postal_ban", default)]
    pub zip_code: Option<String>,
    #[serde(rename = "nom_commune_ban", default)]
    pub city: Option<String>,
    #[serde(rename = "code_departement_ban", default)]
    pub department: Option<String>,
    #[serde(rename = "etiquette_dpe", default)]
    pub energy_label: Option<String>,
    #[serde(rename = "etiquette_ges", default)]
    pub climate_label: Option<String>,
    #[serde(rename = "date_etablissement_dpe", default)]
    pub established_on: Option<String>,
    #[serde(rename = "type_batiment", default)]
    pub building_type: Option<String>,
    #[serde(rename = "surface_habitable_logement", default)]
    pub living_area: Option<f64>,
    #[serde(rename = "_geopoint", default)]
    pub geopoint: Option<String>,
}

/// One collective-proceedings notice from the BODACC commercial announcements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyFailureNotice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "commercant", default)]
    pub company_name: Option<String>,
    #[serde(rename = "registre", default)]
    pub registry: Option<JsonValue>,
    #[serde(rename = "ville", default)]
    pub city: Option<String>,
    #[serde(rename = "cp", default)]
    pub zip_code: Option<String>,
    #[serde(rename = "numerodepartement", default)]
    pub department: Option<String>,
    #[serde(rename = "dateparution", default)]
    pub published_on: Option<String>,
    #[serde(rename = "familleavis_lib", default)]
    pub family: Option<String>,
    #[serde(rename = "typeavis_lib", default)]
    pub notice_type: Option<String>,
    #[serde(rename = "tribunal", default)]
    pub court: Option<String>,
    #[serde(rename = "listepersonnes", default)]
    pub persons: Option<JsonValue>,
    #[serde(rename = "jugement", default)]
    pub judgment: Option<JsonValue>,
}

/// Source-shaped record before transform. Does not outlive the transform phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum RawRecord {
    Listing(ScrapedPage),
    Auction(ScrapedPage),
    EnergyDiagnostic(EnergyDiagnosticLine),
    CompanyFailure(CompanyFailureNotice),
}

impl RawRecord {
    pub fn kind(&self) -> JobKind {
        match self {
            RawRecord::Listing(_) => JobKind::Listing,
            RawRecord::Auction(_) => JobKind::Auction,
            RawRecord::EnergyDiagnostic(_) => JobKind::EnergyDiagnostic,
            RawRecord::CompanyFailure(_) => JobKind::CompanyFailure,
        }
    }

    pub fn scraped(kind: JobKind, page: ScrapedPage) -> Option<Self> {
        match kind {
            JobKind::Listing => Some(RawRecord::Listing(page)),
            JobKind::Auction => Some(RawRecord::Auction(page)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Source record mapped into the canonical shape, plus enrichment slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source: JobKind,
    pub external_id: String,
    pub opportunity_type: OpportunityType,
    pub label: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub department: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub opportunity_date: NaiveDate,
    pub payload: JsonValue,
    pub refined_address: Option<String>,
    pub confidence: Option<f64>,
}

impl CandidateRecord {
    /// Map a raw record into the canonical shape. Rejects records lacking
    /// identity (external id, label) or any location hint; coordinates may
    /// still be absent and are checked by [`CandidateRecord::validate`].
    pub fn from_raw(raw: RawRecord, observed_on: NaiveDate) -> Result<Self, ValidationError> {
        match raw {
            RawRecord::Listing(page) => from_scraped(JobKind::Listing, page, observed_on),
            RawRecord::Auction(page) => from_scraped(JobKind::Auction, page, observed_on),
            RawRecord::EnergyDiagnostic(line) => from_energy_line(line, observed_on),
            RawRecord::CompanyFailure(notice) => from_company_notice(notice, observed_on),
        }
    }

    /// Source-qualified identity used as the persistence uniqueness key.
    pub fn qualified_external_id(&self) -> String {
        format!("{}:{}", self.source.as_str(), self.external_id)
    }

    /// Best address to geocode: the refined one when accepted, else the original.
    pub fn geocoding_query(&self) -> Option<String> {
        if let Some(refined) = &self.refined_address {
            return Some(refined.clone());
        }
        let mut parts = Vec::new();
        if let Some(address) = &self.address {
            parts.push(address.clone());
        }
        let already_has_zip = match (&self.address, &self.zip_code) {
            (Some(address), Some(zip)) => address.contains(zip.as_str()),
            _ => false,
        };
        if !already_has_zip {
            if let Some(zip) = &self.zip_code {
                parts.push(zip.clone());
            }
            if let Some(city) = &self.city {
                if !parts.iter().any(|p| p.contains(city.as_str())) {
                    parts.push(city.clone());
                }
            }
        }
        let query = parts.join(" ");
        text_or_none(&query)
    }

    /// Persistence gate: address, external id and valid coordinates are mandatory.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.external_id.trim().is_empty() {
            return Err(ValidationError::MissingField("external_id"));
        }
        if self.label.trim().is_empty() {
            return Err(ValidationError::MissingField("label"));
        }
        if self.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
            return Err(ValidationError::MissingField("address"));
        }
        match self.coordinates {
            None => Err(ValidationError::MissingField("coordinates")),
            Some(coords) if !coords.is_valid() => Err(ValidationError::InvalidField {
                field: "coordinates",
                reason: format!("{},{} out of range", coords.latitude, coords.longitude),
            }),
            Some(_) => Ok(()),
        }
    }
}

/// Canonical persisted opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub opportunity_type: OpportunityType,
    pub label: String,
    pub address: String,
    pub zip_code: Option<String>,
    pub department: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub opportunity_date: NaiveDate,
    pub external_id: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn from_candidate(candidate: &CandidateRecord) -> Result<Self, ValidationError> {
        candidate.validate()?;
        let coords = candidate
            .coordinates
            .ok_or(ValidationError::MissingField("coordinates"))?;
        let address = candidate
            .refined_address
            .clone()
            .or_else(|| candidate.address.clone())
            .ok_or(ValidationError::MissingField("address"))?;
        Ok(Self {
            id: Uuid::new_v4(),
            opportunity_type: candidate.opportunity_type,
            label: candidate.label.clone(),
            address,
            zip_code: candidate.zip_code.clone(),
            department: candidate.department.clone(),
            latitude: coords.latitude,
            longitude: coords.longitude,
            opportunity_date: candidate.opportunity_date,
            external_id: candidate.qualified_external_id(),
            payload: candidate.payload.clone(),
            created_at: Utc::now(),
        })
    }
}

/// Per-job counters, emitted once as the job result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub fetched: u64,
    pub valid: u64,
    pub invalid: u64,
    pub enriched: u64,
    pub inserted: u64,
    pub duplicates_skipped: u64,
    pub errors: u64,
}

impl ProcessingStats {
    pub fn merge(&mut self, other: &ProcessingStats) {
        self.fetched += other.fetched;
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.enriched += other.enriched;
        self.inserted += other.inserted;
        self.duplicates_skipped += other.duplicates_skipped;
        self.errors += other.errors;
    }

    /// Whether any phase produced something worth reporting.
    pub fn has_useful_work(&self) -> bool {
        self.fetched > 0 || self.valid > 0 || self.inserted > 0
    }
}

pub fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Accepts ISO dates, ISO timestamps and French `dd/mm/yyyy`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.date_naive());
    }
    if let Some(prefix) = text.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }
    NaiveDate::parse_from_str(text, "%d/%m/%Y").ok()
}

/// Department code for a French postal code (Corsica and overseas included).
pub fn department_from_zip(zip: &str) -> Option<String> {
    let zip = zip.trim();
    if zip.len() != 5 || !zip.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if zip.starts_with("97") || zip.starts_with("98") {
        return Some(zip[..3].to_string());
    }
    if zip.starts_with("20") {
        let number: u32 = zip.parse().ok()?;
        return Some(if number < 20200 { "2A" } else { "2B" }.to_string());
    }
    Some(zip[..2].to_string())
}

fn from_scraped(
    kind: JobKind,
    page: ScrapedPage,
    observed_on: NaiveDate,
) -> Result<CandidateRecord, ValidationError> {
    let external_id = page
        .external_id
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("external_id"))?;
    let label = page
        .title
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("label"))?;

    let zip_code = page.zip_code.as_deref().and_then(text_or_none);
    let city = page.city.as_deref().and_then(text_or_none);
    let address = page
        .address
        .as_deref()
        .and_then(text_or_none)
        .or_else(|| {
            let joined = [zip_code.as_deref(), city.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            text_or_none(&joined)
        })
        .ok_or(ValidationError::MissingField("location"))?;

    let opportunity_date = page
        .event_date
        .as_deref()
        .and_then(parse_date)
        .unwrap_or(observed_on);
    let department = zip_code.as_deref().and_then(department_from_zip);

    let payload = json!({
        "url": page.url,
        "price": page.price,
        "description": page.description,
        "attributes": page.attributes,
        "features": page.features,
        "images": page.images,
        "contact": page.contact.filter(|c| !c.is_empty()),
        "energy_rating": page.energy_rating,
    });

    Ok(CandidateRecord {
        source: kind,
        external_id,
        opportunity_type: kind.opportunity_type(),
        label,
        address: Some(address),
        city,
        zip_code,
        department,
        coordinates: page.coordinates.filter(Coordinates::is_valid),
        opportunity_date,
        payload,
        refined_address: None,
        confidence: None,
    })
}

fn from_energy_line(
    line: EnergyDiagnosticLine,
    observed_on: NaiveDate,
) -> Result<CandidateRecord, ValidationError> {
    let external_id = line
        .diagnostic_number
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("external_id"))?;
    let address = line
        .address
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("location"))?;
    let energy_label = line.energy_label.as_deref().and_then(text_or_none);
    let label = match (&energy_label, &line.building_type) {
        (Some(grade), Some(building)) => format!("DPE {grade} - {building}"),
        (Some(grade), None) => format!("DPE {grade}"),
        (None, _) => "DPE".to_string(),
    };
    let zip_code = line.zip_code.as_deref().and_then(text_or_none);
    let department = line
        .department
        .as_deref()
        .and_then(text_or_none)
        .or_else(|| zip_code.as_deref().and_then(department_from_zip));
    let opportunity_date = line
        .established_on
        .as_deref()
        .and_then(parse_date)
        .unwrap_or(observed_on);

    Ok(CandidateRecord {
        source: JobKind::EnergyDiagnostic,
        external_id,
        opportunity_type: OpportunityType::EnergySieve,
        label,
        address: Some(address),
        city: line.city.as_deref().and_then(text_or_none),
        zip_code,
        department,
        coordinates: line.geopoint.as_deref().and_then(Coordinates::parse_pair),
        opportunity_date,
        payload: json!({
            "energy_label": energy_label,
            "climate_label": line.climate_label,
            "building_type": line.building_type,
            "living_area": line.living_area,
        }),
        refined_address: None,
        confidence: None,
    })
}

fn from_company_notice(
    notice: CompanyFailureNotice,
    observed_on: NaiveDate,
) -> Result<CandidateRecord, ValidationError> {
    let external_id = notice
        .id
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("external_id"))?;
    let label = notice
        .company_name
        .as_deref()
        .and_then(text_or_none)
        .ok_or(ValidationError::MissingField("label"))?;

    let persons = notice.persons.as_ref().map(decode_embedded_json);
    let seat = persons.as_ref().and_then(registered_office);
    let zip_code = seat
        .as_ref()
        .and_then(|s| s.zip_code.clone())
        .or_else(|| notice.zip_code.as_deref().and_then(text_or_none));
    let city = seat
        .as_ref()
        .and_then(|s| s.city.clone())
        .or_else(|| notice.city.as_deref().and_then(text_or_none));
    let street = seat.as_ref().and_then(|s| s.street.clone());
    let address = [street.as_deref(), zip_code.as_deref(), city.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let address = text_or_none(&address).ok_or(ValidationError::MissingField("location"))?;

    let department = notice
        .department
        .as_deref()
        .and_then(text_or_none)
        .or_else(|| zip_code.as_deref().and_then(department_from_zip));
    let opportunity_date = notice
        .published_on
        .as_deref()
        .and_then(parse_date)
        .unwrap_or(observed_on);
    let judgment = notice.judgment.as_ref().map(decode_embedded_json);

    Ok(CandidateRecord {
        source: JobKind::CompanyFailure,
        external_id,
        opportunity_type: OpportunityType::Liquidation,
        label,
        address: Some(address),
        city,
        zip_code,
        department,
        coordinates: None,
        opportunity_date,
        payload: json!({
            "registry": notice.registry,
            "family": notice.family,
            "notice_type": notice.notice_type,
            "court": notice.court,
            "judgment": judgment,
        }),
        refined_address: None,
        confidence: None,
    })
}

/// Some portals publish nested objects as JSON-encoded strings.
fn decode_embedded_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

struct Seat {
    street: Option<String>,
    zip_code: Option<String>,
    city: Option<String>,
}

fn registered_office(persons: &JsonValue) -> Option<Seat> {
    let person = match persons {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let person = person.get("personne").unwrap_or(person);
    let seat = person
        .get("adresseSiegeSocial")
        .or_else(|| person.get("adresseEtablissementPrincipal"))?;
    let field = |key: &str| seat.get(key).and_then(JsonValue::as_str).and_then(text_or_none);
    let street = [field("numeroVoie"), field("typeVoie"), field("nomVoie")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    Some(Seat {
        street: text_or_none(&street),
        zip_code: field("codePostal"),
        city: field("ville"),
    })
}
