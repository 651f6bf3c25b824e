//! HTTP client abstraction for testability
//!
//! Used by the notifier path only. The probe path deliberately does not go
//! through this seam: it owns its sockets so it can time each connection
//! phase.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

/// HTTP response from a request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Abstraction over HTTP client for dependency injection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpClient: Send + Sync {
    /// Send a request and read the full response body.
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
        timeout: Duration,
    ) -> crate::Result<HttpResponse>;
}

/// Production HTTP client using reqwest
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
        timeout: Duration,
    ) -> crate::Result<HttpResponse> {
        tracing::debug!("{} {}", method, url);
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| crate::LookoutError::Http(format!("Invalid method {:?}", method)))?;

        let mut request = self.client.request(method, url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| crate::LookoutError::Http(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| crate::LookoutError::Http(format!("Reading response body: {}", e)))?;

        tracing::debug!("{} -> {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}
