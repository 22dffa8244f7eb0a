//! device location lookup through the home assistant config api

use crate::config::GeolocationConfig;
use crate::domain::Coordinates;

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("geolocation source is not configured")]
    NotConfigured,
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation returned out-of-range coordinates ({0}, {1})")]
    OutOfRange(f64, f64),
}

#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn locate(&self) -> Result<Coordinates, GeoError>;
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<ConfigResponse> for Coordinates {
    type Error = GeoError;

    fn try_from(body: ConfigResponse) -> Result<Self, GeoError> {
        let valid = (-90.0..=90.0).contains(&body.latitude) && (-180.0..=180.0).contains(&body.longitude);
        if !valid {
            return Err(GeoError::OutOfRange(body.latitude, body.longitude));
        }
        Ok(Coordinates::new(body.latitude, body.longitude))
    }
}

/// `GET {url}/api/config` with a long-lived access token
pub struct HomeAssistantLocator {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HomeAssistantLocator {
    pub fn new(config: &GeolocationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl Geolocator for HomeAssistantLocator {
    async fn locate(&self) -> Result<Coordinates, GeoError> {
        if self.url.is_empty() || self.token.is_empty() {
            return Err(GeoError::NotConfigured);
        }
        let body: ConfigResponse = self
            .client
            .get(format!("{}/api/config", self.url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Coordinates::try_from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_home_assistant_config() {
        let body: ConfigResponse = serde_json::from_str(
            r#"{"latitude": 59.8586, "longitude": 17.6389, "elevation": 20, "unit_system": {}}"#,
        )
        .unwrap();
        let coords = Coordinates::try_from(body).unwrap();
        assert_eq!(coords, Coordinates::new(59.8586, 17.6389));
    }

    #[test]
    fn rejects_impossible_coordinates() {
        let body = ConfigResponse { latitude: 123.0, longitude: 0.0 };
        assert!(matches!(Coordinates::try_from(body), Err(GeoError::OutOfRange(..))));
    }

    #[tokio::test]
    async fn missing_token_is_not_configured() {
        let locator = HomeAssistantLocator::new(&GeolocationConfig::default()).unwrap();
        assert!(matches!(locator.locate().await, Err(GeoError::NotConfigured)));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let config = GeolocationConfig {
            url: "http://127.0.0.1:9/".to_string(),
            token: "abc".to_string(),
            timeout_secs: 2,
            ..GeolocationConfig::default()
        };
        let locator = HomeAssistantLocator::new(&config).unwrap();
        assert!(matches!(locator.locate().await, Err(GeoError::Http(_))));
    }
}
