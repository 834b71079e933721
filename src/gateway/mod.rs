//! Admission gateway: CORS, fixed-window rate limiting and request
//! counting in front of an HTTP relay to the producer.

pub mod cors;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod relay;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::RelayError;
use crate::types::GatewayConfig;
use cors::CorsPolicy;
use metrics::GatewayMetrics;
use rate_limit::FixedWindowLimiter;
use relay::ProducerRelay;

/// Application state shared across gateway handlers and middleware.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub limiter: FixedWindowLimiter,
    pub metrics: GatewayMetrics,
    pub relay: ProducerRelay,
    pub cors: CorsPolicy,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>, RelayError> {
        let limiter = FixedWindowLimiter::new(config.rate_limit_max, config.rate_limit_window());
        let metrics = GatewayMetrics::new()?;
        let relay = ProducerRelay::new(config.relay_target_url.clone(), config.relay_timeout())?;
        let cors = CorsPolicy::from_config(&config)?;

        info!(
            target_url = %config.relay_target_url,
            rate_limit_max = config.rate_limit_max,
            rate_limit_window_ms = config.rate_limit_window_ms,
            "Gateway configured"
        );

        Ok(Arc::new(Self {
            config,
            limiter,
            metrics,
            relay,
            cors,
        }))
    }
}

/// Build the gateway's HTTP routes.
///
/// Only `/submit` is rate limited. Counting runs before admission so
/// throttled requests are still recorded, and covers the fallback so
/// unknown paths are recorded too. Preflights are answered before counting.
pub fn router(state: Arc<GatewayState>) -> Router {
    let submit = any(handlers::submit).layer(middleware::from_fn_with_state(
        state.clone(),
        rate_limit::enforce,
    ));

    Router::new()
        .route("/", get(handlers::liveness))
        .route("/metrics", get(handlers::metrics))
        .route("/submit", submit)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), metrics::track))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, cors::apply))
        .layer(TraceLayer::new_for_http())
}
