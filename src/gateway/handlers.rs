//! HTTP request handlers for the gateway.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, info};
use uuid::Uuid;

use super::relay::REQUEST_ID_HEADER;
use super::GatewayState;
use crate::error::RelayError;

/// Liveness probe.
pub async fn liveness() -> &'static str {
    "API Gateway UP"
}

/// Answer for paths no route matched.
pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Prometheus exposition of the gateway counters.
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> Result<Response, RelayError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response())
}

/// Relay an admitted request to the producer and mirror its answer.
pub async fn submit(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let upstream = state
        .relay
        .forward(&method, content_type, &request_id, body)
        .await
        .map_err(|e| {
            error!(request_id = %request_id, target = %state.relay.target(), error = %e, "Proxy error");
            e
        })?;

    info!(
        request_id = %request_id,
        method = %method,
        status = %upstream.status,
        "Relayed to producer"
    );

    let mut response = (upstream.status, upstream.body).into_response();
    match upstream
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        Some(value) => {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        None => {
            response.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    Ok(response)
}
