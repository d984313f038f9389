use std::sync::Arc;

use harvest_core::{CandidateRecord, ProcessingStats};
use harvest_storage::{passes_confidence, AddressContext, AddressRefiner, GeocodingService};
use tracing::{debug, warn};

/// Result of enriching a single record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichOutcome {
    pub refined: bool,
    pub geocoded: bool,
    pub errors: u64,
}

impl EnrichOutcome {
    pub fn changed(&self) -> bool {
        self.refined || self.geocoded
    }
}

/// Best-effort enrichment. A failing service leaves the record as it was.
#[derive(Clone)]
pub struct Enricher {
    geocoder: Option<Arc<dyn GeocodingService>>,
    refiner: Option<Arc<dyn AddressRefiner>>,
    min_refine_confidence: f64,
}

impl Enricher {
    pub fn new(
        geocoder: Option<Arc<dyn GeocodingService>>,
        refiner: Option<Arc<dyn AddressRefiner>>,
        min_refine_confidence: f64,
    ) -> Self {
        Self {
            geocoder,
            refiner,
            min_refine_confidence,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, 0.7)
    }

    pub fn is_enabled(&self) -> bool {
        self.geocoder.is_some() || self.refiner.is_some()
    }

    pub async fn enrich(&self, record: &mut CandidateRecord) -> EnrichOutcome {
        let mut outcome = EnrichOutcome::default();

        if let (Some(refiner), Some(address)) = (&self.refiner, record.address.clone()) {
            let context = AddressContext {
                label: record.label.clone(),
                city: record.city.clone(),
                zip_code: record.zip_code.clone(),
                description: record
                    .payload
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };
            match refiner.refine_address(&address, &context).await {
                Ok(Some(refinement)) if passes_confidence(refinement.confidence, self.min_refine_confidence) => {
                    record.refined_address = Some(refinement.refined_address);
                    record.confidence = Some(refinement.confidence);
                    outcome.refined = true;
                }
                Ok(Some(refinement)) => {
                    debug!(
                        external_id = %record.external_id,
                        confidence = refinement.confidence,
                        "refinement below threshold, kept original address"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(external_id = %record.external_id, error = %err, "address refinement failed");
                    outcome.errors += 1;
                }
            }
        }

        if record.coordinates.is_none() {
            if let (Some(geocoder), Some(query)) = (&self.geocoder, record.geocoding_query()) {
                match geocoder.geocode(&query).await {
                    Ok(Some(coordinates)) => {
                        record.coordinates = Some(coordinates);
                        outcome.geocoded = true;
                    }
                    Ok(None) => debug!(external_id = %record.external_id, %query, "no confident geocode"),
                    Err(err) => {
                        warn!(external_id = %record.external_id, error = %err, "geocoding failed");
                        outcome.errors += 1;
                    }
                }
            }
        }

        outcome
    }

    /// Enrich records one after another; per-record failures only bump `stats.errors`.
    pub async fn enrich_all(&self, mut records: Vec<CandidateRecord>, stats: &mut ProcessingStats) -> Vec<CandidateRecord> {
        if !self.is_enabled() {
            return records;
        }
        for record in records.iter_mut() {
            let outcome = self.enrich(record).await;
            if outcome.changed() {
                stats.enriched += 1;
            }
            stats.errors += outcome.errors;
        }
        records
    }
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("geocoder", &self.geocoder.is_some())
            .field("refiner", &self.refiner.is_some())
            .field("min_refine_confidence", &self.min_refine_confidence)
            .finish()
    }
}
