use async_trait::async_trait;
use harvest_core::Coordinates;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{FetchError, RateLimitedClient};

pub const DEFAULT_GEOCODER_URL: &str = "https://api-adresse.data.gouv.fr";
pub const DEFAULT_MIN_SCORE: f64 = 0.5;

/// Score gate shared by geocoding matches. The threshold is inclusive.
pub fn passes_confidence(score: f64, threshold: f64) -> bool {
    score >= threshold
}

#[async_trait]
pub trait GeocodingService: Send + Sync {
    /// `Ok(None)` when the service has no match above its confidence gate.
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeMatch {
    pub coordinates: Coordinates,
    pub label: Option<String>,
    pub postcode: Option<String>,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    #[serde(default)]
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureProperties {
    label: Option<String>,
    postcode: Option<String>,
    #[serde(default)]
    score: f64,
}

/// Client for the national address API (`/search/?q=...`), GeoJSON in `[lon, lat]` order.
#[derive(Debug)]
pub struct AddressApiGeocoder {
    client: RateLimitedClient,
    base_url: String,
    min_score: f64,
}

impl AddressApiGeocoder {
    pub fn new(client: RateLimitedClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            min_score: DEFAULT_MIN_SCORE,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    pub async fn lookup(&self, address: &str) -> Result<Option<GeocodeMatch>, FetchError> {
        let url = format!("{}/search/", self.base_url.trim_end_matches('/'));
        let query = [
            ("q".to_string(), address.to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let collection: FeatureCollection = self.client.get_json(&url, &query).await?;

        let Some(feature) = collection.features.into_iter().next() else {
            debug!(address, "geocoder returned no feature");
            return Ok(None);
        };
        let score = feature.properties.score;
        if !passes_confidence(score, self.min_score) {
            debug!(address, score, min_score = self.min_score, "geocoder match below threshold");
            return Ok(None);
        }
        let [longitude, latitude] = match feature.geometry.coordinates.as_slice() {
            [lon, lat, ..] => [*lon, *lat],
            _ => return Ok(None),
        };
        let coordinates = Coordinates::new(latitude, longitude);
        if !coordinates.is_valid() {
            return Ok(None);
        }
        Ok(Some(GeocodeMatch {
            coordinates,
            label: feature.properties.label,
            postcode: feature.properties.postcode,
            score,
        }))
    }
}

#[async_trait]
impl GeocodingService for AddressApiGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        Ok(self.lookup(address).await?.map(|m| m.coordinates))
    }
}

/// What the refiner sees besides the raw address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AddressContext {
    pub label: String,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRefinement {
    pub refined_address: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait AddressRefiner: Send + Sync {
    async fn refine_address(
        &self,
        current: &str,
        context: &AddressContext,
    ) -> Result<Option<AddressRefinement>, FetchError>;
}

const REFINER_PROMPT: &str = "You normalize French postal addresses. Reply with a JSON object \
{\"refined_address\": string, \"confidence\": number between 0 and 1, \"reasoning\": string}. \
Use only information present in the input.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Address refinement through an OpenAI-compatible chat-completions endpoint.
#[derive(Debug)]
pub struct ChatCompletionRefiner {
    client: RateLimitedClient,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionRefiner {
    pub fn new(
        client: RateLimitedClient,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl AddressRefiner for ChatCompletionRefiner {
    async fn refine_address(
        &self,
        current: &str,
        context: &AddressContext,
    ) -> Result<Option<AddressRefinement>, FetchError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": REFINER_PROMPT },
                {
                    "role": "user",
                    "content": json!({ "address": current, "context": context }).to_string(),
                },
            ],
        });
        let response: ChatResponse = self
            .client
            .post_json(&self.endpoint, &body, self.api_key.as_deref())
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);
        Ok(content.as_deref().and_then(parse_refinement))
    }
}

/// Unparseable or empty answers are treated as "no refinement".
fn parse_refinement(content: &str) -> Option<AddressRefinement> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut refinement: AddressRefinement = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "refiner answer is not valid json");
            return None;
        }
    };
    if refinement.refined_address.trim().is_empty() || !refinement.confidence.is_finite() {
        return None;
    }
    refinement.confidence = refinement.confidence.clamp(0.0, 1.0);
    Some(refinement)
}
