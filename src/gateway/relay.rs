//! HTTP relay from the gateway to the producer.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode};
use tracing::{debug, instrument};

use crate::error::RelayError;

/// Forwarded when the client sent no content type.
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Header carrying the gateway-assigned request id upstream.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// What the producer answered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Forwards admitted requests to a single producer endpoint.
#[derive(Debug, Clone)]
pub struct ProducerRelay {
    client: reqwest::Client,
    target: String,
    timeout: Duration,
}

impl ProducerRelay {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // The producer is a sibling service; never route it through a proxy.
            .no_proxy()
            .build()
            .map_err(|e| RelayError::Setup(format!("failed to build relay client: {e}")))?;

        Ok(Self {
            client,
            target: target.into(),
            timeout,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send one request upstream, preserving method, body and content type.
    #[instrument(skip(self, body), fields(target = %self.target, bytes = body.len()))]
    pub async fn forward(
        &self,
        method: &Method,
        content_type: Option<&str>,
        request_id: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, RelayError> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| RelayError::InvalidPayload(e.to_string()))?;

        let response = self
            .client
            .request(method, &self.target)
            .header(
                reqwest::header::CONTENT_TYPE,
                content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
            )
            .header(REQUEST_ID_HEADER, request_id)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        debug!(status = %status, "Upstream responded");

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }

    fn classify(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::UpstreamTimeout(self.timeout)
        } else {
            RelayError::UpstreamUnavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let relay = ProducerRelay::new("http://127.0.0.1:1/produce", Duration::from_secs(2)).unwrap();
        let result = relay
            .forward(&Method::POST, None, "req-1", Bytes::from_static(b"{}"))
            .await;

        assert!(matches!(result, Err(RelayError::UpstreamUnavailable(_))));
    }

    #[test]
    fn test_target_is_kept() {
        let relay = ProducerRelay::new("http://producer:4000/produce", Duration::from_secs(1)).unwrap();
        assert_eq!(relay.target(), "http://producer:4000/produce");
    }
}
