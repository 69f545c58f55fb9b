use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::traits::{ImageBody, ImageSource};
use crate::error::EngineError;

/// HTTP fetch backend. One shared connection pool for all requests; custom
/// headers are injected per request.
pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Build a GET request with the caller-supplied headers attached.
    fn build_request(&self, url: &str, headers: &BTreeMap<String, String>) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

impl Default for HttpImageSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a response status to the retry classification: 5xx is worth retrying,
/// any other non-success is not.
fn classify_status(status: StatusCode, url: &str) -> EngineError {
    if status.is_server_error() {
        EngineError::NetworkTransient(format!("HTTP {} for {}", status.as_u16(), url))
    } else {
        EngineError::NetworkPermanent(format!("HTTP {} for {}", status.as_u16(), url))
    }
}

fn classify_request_error(err: reqwest::Error, url: &str) -> EngineError {
    if err.is_builder() || err.is_request() {
        EngineError::NetworkPermanent(format!("invalid request for {}: {}", url, err))
    } else {
        // Connect failures, resets and timeouts are all retryable.
        EngineError::NetworkTransient(format!("request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ImageBody, EngineError> {
        let resp = self
            .build_request(url, headers)
            .send()
            .await
            .map_err(|e| classify_request_error(e, url))?;

        let status = resp.status();
        debug!("http fetch status={} url={}", status.as_u16(), url);
        if !status.is_success() {
            warn!("http fetch failed status={} url={}", status.as_u16(), url);
            return Err(classify_status(status, url));
        }

        let content_length = resp.content_length();
        let url_owned = url.to_string();
        let stream = resp.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                EngineError::NetworkTransient(format!("body read from {} failed: {}", url_owned, e))
            })
        });

        Ok(ImageBody {
            content_length,
            stream: Box::pin(stream),
        })
    }
}
