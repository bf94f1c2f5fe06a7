//! Reverse geocoding of event positions.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::remote::{HttpTimeouts, RemoteError, RemoteResult};
use crate::types::{Address, GeoPosition};

/// Turns a position into address fields.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Address at `position`, `None` when nothing is known there.
    async fn reverse(&self, position: &GeoPosition) -> RemoteResult<Option<Address>>;
}

/// Geocoder backed by a Nominatim-compatible `/reverse` endpoint.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
}

#[derive(Deserialize)]
struct NominatimAddress {
    road: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
}

impl From<NominatimAddress> for Address {
    fn from(raw: NominatimAddress) -> Self {
        Self {
            street: raw.road,
            city: raw.city.or(raw.town).or(raw.village),
            region: raw.state,
            postal_code: raw.postcode,
        }
    }
}

impl NominatimGeocoder {
    /// Query the service at `base_url`. A lookup that outlives `timeouts`
    /// fails and the event is recorded without an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeouts: HttpTimeouts) -> RemoteResult<Self> {
        let client = timeouts
            .client_builder()
            .user_agent(concat!("convoy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, position: &GeoPosition) -> RemoteResult<Option<Address>> {
        let url = format!("{}/reverse", self.base_url);
        let response: ReverseResponse = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", position.latitude.to_string()),
                ("lon", position.longitude.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|err| RemoteError::Decode {
                path: url.clone(),
                message: err.to_string(),
            })?;

        let address = response.address.map(Address::from).filter(|a| !a.is_empty());
        debug!(found = address.is_some(), "Reverse geocoded position");
        Ok(address)
    }
}
