//! HTTP transport implementation using reqwest.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::errors::ConfigError;

/// Reqwest-based HTTP transport implementation.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Creates a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ConfigError::HttpClient {
                message: e.to_string(),
            })?;
        Self::with_client(client, base_url, timeout)
    }

    /// Creates a transport around an existing client.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            timeout,
        })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds a full URL from a path.
    fn build_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.build_url(&request.path);
        let mut builder = self.client.request(request.method.into(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn url_for(&self, request: &HttpRequest) -> String {
        self.build_url(&request.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_joins_slashes() {
        let transport =
            ReqwestTransport::new("https://inventory.internal/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.url_for(&HttpRequest::get("/items/42")),
            "https://inventory.internal/api/items/42"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ReqwestTransport::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }
}
