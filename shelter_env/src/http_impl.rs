//! Production implementation of SimulationTransport over HTTP.

use crate::error::EnvError;
use crate::transport::{unwrap_envelope, SimulationTransport};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// HTTP transport to the simulation service's REST API.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport rooted at `base_url` (e.g. `http://127.0.0.1:8000/api`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, EnvError> {
        let client = Client::builder()
            .build()
            .map_err(|e| EnvError::Context(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn finish(response: reqwest::Response, timeout: Duration) -> Result<Value, EnvError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(EnvError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        unwrap_envelope(body)
    }
}

#[async_trait]
impl SimulationTransport for HttpTransport {
    async fn get(&self, path: &str, timeout: Duration) -> Result<Value, EnvError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        Self::finish(response, timeout).await
    }

    async fn post(&self, path: &str, body: Option<Value>, timeout: Duration) -> Result<Value, EnvError> {
        let mut request = self.client.post(self.url(path)).timeout(timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        Self::finish(response, timeout).await
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> EnvError {
    if err.is_timeout() {
        EnvError::Timeout(timeout.as_millis() as u64)
    } else if err.is_decode() {
        EnvError::Serialization(err.to_string())
    } else {
        EnvError::network(err.to_string())
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h/api/", "live_state"), "http://h/api/live_state");
        assert_eq!(join_url("http://h/api", "/status"), "http://h/api/status");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let result = transport.get("status", Duration::from_millis(500)).await;
        assert!(matches!(result, Err(EnvError::Network(_)) | Err(EnvError::Timeout(_))));
    }
}
