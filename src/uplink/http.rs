//! HTTP implementations of the uplink seams

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Connectivity, Uplink};
use crate::error::{Result, TelemetryError};

/// POSTs payloads to `<endpoint>/<device_id>`, one instance per upload target
#[derive(Debug, Clone)]
pub struct HttpUplink {
    client: Client,
    url: String,
}

impl HttpUplink {
    /// # Errors
    ///
    /// Returns `Delivery` if the HTTP client cannot be built.
    pub fn new(endpoint: &str, device_id: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: device_url(endpoint, device_id),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Uplink for HttpUplink {
    async fn deliver(&self, payload: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| TelemetryError::Delivery(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TelemetryError::Delivery(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }
        Ok(())
    }
}

/// Treats any HTTP response to a HEAD request as "online"
#[derive(Debug, Clone)]
pub struct HttpConnectivity {
    client: Client,
    url: String,
}

impl HttpConnectivity {
    /// # Errors
    ///
    /// Returns `Delivery` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Connectivity for HttpConnectivity {
    async fn is_online(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe to {} failed: {}", self.url, e);
                false
            }
        }
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TelemetryError::Delivery(format!("Failed to build HTTP client: {}", e)))
}

fn device_url(endpoint: &str, device_id: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // nothing listens on the discard port in the test environment
    const UNREACHABLE: &str = "http://127.0.0.1:9";

    #[test]
    fn test_device_url() {
        assert_eq!(
            device_url("https://api.example.com/locations", "truck-07"),
            "https://api.example.com/locations/truck-07"
        );
        assert_eq!(
            device_url("https://api.example.com/locations/", "truck-07"),
            "https://api.example.com/locations/truck-07"
        );
        assert_eq!(
            device_url("https://api.example.com/images", "truck-07"),
            "https://api.example.com/images/truck-07"
        );
    }

    #[tokio::test]
    async fn test_delivery_to_unreachable_host_fails() {
        let uplink = HttpUplink::new(UNREACHABLE, "truck-07", Duration::from_secs(2)).unwrap();
        assert_eq!(uplink.url(), "http://127.0.0.1:9/truck-07");

        let result = uplink.deliver(&json!({"lat": "41.0"})).await;
        assert!(matches!(result, Err(TelemetryError::Delivery(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_offline() {
        let connectivity = HttpConnectivity::new(UNREACHABLE, Duration::from_secs(2)).unwrap();
        assert!(!connectivity.is_online().await);
    }
}
