//! Request and throttle counters in Prometheus exposition format.

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use super::GatewayState;
use crate::error::RelayError;

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Counters owned by one gateway instance.
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    throttled_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, RelayError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "api_gateway_requests_total",
                "Total number of requests to API Gateway",
            ),
            &["route", "method"],
        )?;
        let throttled_total = IntCounterVec::new(
            Opts::new("api_gateway_429_total", "Total number of 429 responses"),
            &["route"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(throttled_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            throttled_total,
        })
    }

    pub fn record_request(&self, route: &str, method: &str) {
        self.requests_total.with_label_values(&[route, method]).inc();
    }

    pub fn record_throttle(&self, route: &str) {
        self.throttled_total.with_label_values(&[route]).inc();
    }

    pub fn requests(&self, route: &str, method: &str) -> u64 {
        self.requests_total.with_label_values(&[route, method]).get()
    }

    pub fn throttled(&self, route: &str) -> u64 {
        self.throttled_total.with_label_values(&[route]).get()
    }

    /// Content type of [`render`](Self::render) output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    pub fn render(&self) -> Result<String, RelayError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }
}

/// Count every request by route template and method.
///
/// Requests that hit no route share one label so arbitrary paths cannot
/// grow the label set.
pub async fn track(State(state): State<Arc<GatewayState>>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    state
        .metrics
        .record_request(&route, request.method().as_str());

    next.run(request).await
}
