//! Consumer health surface.

use axum::{routing::get, Json, Router};
use tower_http::trace::TraceLayer;

use crate::types::ConsumerHealth;
use crate::CONSUMER_SERVICE_NAME;

/// Health check endpoint.
pub async fn health_check() -> Json<ConsumerHealth> {
    Json(ConsumerHealth {
        status: "ok".to_string(),
        service: CONSUMER_SERVICE_NAME.to_string(),
    })
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
}
