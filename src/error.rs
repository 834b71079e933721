//! Error taxonomy for the relay pipeline.
//!
//! Broker and sink failures are typed per concern; [`RelayError`] is the
//! HTTP-facing set and maps every variant onto a status code. Nothing in
//! here terminates a process: only the consumer binary decides to exit on
//! broker loss.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures talking to the message broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue declaration failed for {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish was negatively confirmed by the broker")]
    Nacked,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("acknowledgment failed: {0}")]
    Ack(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("broker connector is not ready")]
    NotReady,

    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Failures writing to the relational sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to HTTP clients of the gateway and the producer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Rate limit exceeded; clears itself when the window rolls over.
    #[error("Too many requests to {route}")]
    AdmissionRejected { route: String, retry_after: Duration },

    /// Producer unreachable or failed mid-response.
    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Message is required")]
    MissingMessage,

    #[error("Invalid request body: {0}")]
    InvalidPayload(String),

    #[error("Broker not ready")]
    BrokerUnready,

    #[error("Failed to send message: {0}")]
    Publish(BrokerError),

    #[error("Failed to render metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Gateway setup failed: {0}")]
    Setup(String),
}

impl From<BrokerError> for RelayError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotReady => RelayError::BrokerUnready,
            other => RelayError::Publish(other),
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::MissingMessage | RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::BrokerUnready => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Publish(_) | RelayError::Metrics(_) | RelayError::Setup(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Body of a throttled response.
#[derive(Debug, Serialize)]
struct ThrottleBody {
    message: String,
}

/// Body of a failed relay.
#[derive(Debug, Serialize)]
struct ProxyErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            RelayError::AdmissionRejected { route, retry_after } => {
                let body = ThrottleBody {
                    message: format!("Too many requests to {route}"),
                };
                let mut response = (status, Json(body)).into_response();
                // Round up so clients never retry inside the window.
                let secs = retry_after.as_millis().div_ceil(1000);
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            RelayError::UpstreamUnavailable(_) | RelayError::UpstreamTimeout(_) => {
                let body = ProxyErrorBody {
                    error: "Proxy error",
                    message: self.to_string(),
                };
                (status, Json(body)).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
