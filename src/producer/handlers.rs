//! HTTP request handlers for the producer.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error, info};

use super::ProducerState;
use crate::error::RelayError;
use crate::types::{InboundMessage, ProducerHealth};

/// Largest request body the request logger will buffer.
const MAX_LOGGED_BODY: usize = 1024 * 1024;

/// Health check endpoint; reports broker state without requiring it.
pub async fn health_check(State(state): State<Arc<ProducerState>>) -> Json<ProducerHealth> {
    Json(ProducerHealth {
        status: "ok".to_string(),
        broker: state.connector.state(),
    })
}

/// Publish a submitted message to the durable queue.
///
/// Never waits for the broker: a connector that is not ready yields `503`.
pub async fn produce(
    State(state): State<Arc<ProducerState>>,
    body: Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let message = InboundMessage::parse(&body)?;

    if !state.connector.is_ready() {
        error!(state = %state.connector.state(), "Broker channel not ready");
        return Err(RelayError::BrokerUnready);
    }

    state
        .connector
        .publish(message.as_bytes())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to send message");
            RelayError::from(e)
        })?;

    info!(queue = %state.connector.queue(), message = %message, "Sent message");
    Ok("Message sent to broker")
}

/// Log method, URI and body of every request.
pub async fn log_request(request: Request, next: Next) -> Result<Response, RelayError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_LOGGED_BODY)
        .await
        .map_err(|e| RelayError::InvalidPayload(e.to_string()))?;

    debug!(
        method = %parts.method,
        uri = %parts.uri,
        body = %String::from_utf8_lossy(&bytes),
        "Incoming request"
    );

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use crate::broker::memory::{MemoryBroker, RecordingClock};
    use crate::broker::{BrokerConnector, QueueTopology, RetryPolicy};
    use crate::producer::router;

    const QUEUE: &str = "test-queue";

    fn connector(broker: &MemoryBroker) -> Arc<BrokerConnector> {
        BrokerConnector::with_clock(
            Arc::new(broker.clone()),
            QueueTopology::durable(QUEUE),
            RetryPolicy::new(2, Duration::from_millis(10)),
            Arc::new(RecordingClock::default()),
        )
    }

    async fn post_produce(connector: Arc<BrokerConnector>, body: &'static str) -> (StatusCode, String) {
        let response = router(ProducerState::new(connector))
            .oneshot(
                Request::post("/produce")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_produce_publishes_once() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker);
        connector.connect().await;

        let (status, body) = post_produce(connector, r#"{"message":"hello"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Message sent to broker");
        assert_eq!(broker.published(QUEUE), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_missing_message_is_rejected() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker);
        connector.connect().await;

        let (status, body) = post_produce(connector.clone(), r#"{"text":"hello"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Message is required");

        let (status, _) = post_produce(connector, r#"{"message":""}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(broker.published(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_not_ready_returns_503() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let connector = connector(&broker);
        connector.connect().await;

        let (status, body) = post_produce(connector, r#"{"message":"hello"}"#).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Broker not ready");
        assert!(broker.published(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_never_connected_returns_503() {
        let broker = MemoryBroker::new();
        let (status, _) = post_produce(connector(&broker), r#"{"message":"hello"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_cause() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker);
        connector.connect().await;
        broker.fail_publishes("channel closed by server");

        let (status, body) = post_produce(connector, r#"{"message":"hello"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("channel closed by server"));
    }

    #[tokio::test]
    async fn test_health_reports_broker_state() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker);
        connector.connect().await;

        let response = router(ProducerState::new(connector))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: ProducerHealth = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(health.broker, crate::broker::ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_preflight_is_permissive() {
        let broker = MemoryBroker::new();
        let response = router(ProducerState::new(connector(&broker)))
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/produce")
                    .header("origin", "http://example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }
}
