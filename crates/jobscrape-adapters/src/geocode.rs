//! State lookup for listing locations against a Google-style geocoding endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GEOCODER_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

const STATE_COMPONENT: &str = "administrative_area_level_1";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("invalid geocoder endpoint `{endpoint}`: {reason}")]
    Endpoint { endpoint: String, reason: String },
    #[error("geocoding request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("geocoder answered http status {0}")]
    HttpStatus(u16),
    #[error("geocoder refused the lookup: {0}")]
    Refused(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// First-level administrative area of `location`, or `None` when nothing matched.
    async fn state_of(&self, location: &str) -> Result<Option<String>, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    status: Option<String>,
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: String,
    types: Vec<String>,
}

impl GeocodeResponse {
    fn into_state(self) -> Result<Option<String>, GeocodeError> {
        match self.status.as_deref() {
            None | Some("OK") | Some("ZERO_RESULTS") => {}
            Some(other) => return Err(GeocodeError::Refused(other.to_string())),
        }
        Ok(self.results.into_iter().next().and_then(|first| {
            first
                .address_components
                .into_iter()
                .find(|c| c.types.iter().any(|t| t == STATE_COMPONENT))
                .map(|c| c.long_name)
        }))
    }
}

#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpGeocoder {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GeocodeError::Request)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    fn lookup_url(&self, location: &str) -> Result<Url, GeocodeError> {
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("address", location),
                ("types", "administrative_area_level_2"),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|err| GeocodeError::Endpoint {
            endpoint: self.endpoint.clone(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn state_of(&self, location: &str) -> Result<Option<String>, GeocodeError> {
        let url = self.lookup_url(location)?;
        // The url carries the api key.
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GeocodeError::Request(err.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::HttpStatus(status.as_u16()));
        }
        let body: GeocodeResponse = response
            .json()
            .await
            .map_err(|err| GeocodeError::Request(err.without_url()))?;
        let state = body.into_state()?;
        debug!(location, state = ?state, "location geocoded");
        Ok(state)
    }
}
