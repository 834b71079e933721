//! Queue producer: validates submissions and publishes them to the durable queue.

pub mod handlers;

use std::sync::Arc;

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::broker::BrokerConnector;

/// Application state shared across producer handlers.
pub struct ProducerState {
    pub connector: Arc<BrokerConnector>,
}

impl ProducerState {
    pub fn new(connector: Arc<BrokerConnector>) -> Arc<Self> {
        Arc::new(Self { connector })
    }
}

/// Build the producer's HTTP routes.
pub fn router(state: Arc<ProducerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/produce", post(handlers::produce))
        .with_state(state)
        .layer(middleware::from_fn(handlers::log_request))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
}
