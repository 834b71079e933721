//! Cross-origin headers for the gateway.
//!
//! Every response carries the configured origin, methods and headers;
//! `OPTIONS` requests on any path are answered with `204` and no body.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::GatewayState;
use crate::error::RelayError;
use crate::types::GatewayConfig;

/// Header values applied to every gateway response.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
}

impl CorsPolicy {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, RelayError> {
        let value = |name: &str, raw: &str| {
            HeaderValue::from_str(raw)
                .map_err(|e| RelayError::Setup(format!("invalid {name} '{raw}': {e}")))
        };

        Ok(Self {
            allow_origin: value("FRONTEND_ORIGIN", &config.frontend_origin)?,
            allow_methods: value("CORS_ALLOW_METHODS", &config.cors_allow_methods)?,
            allow_headers: value("CORS_ALLOW_HEADERS", &config.cors_allow_headers)?,
        })
    }

    /// Overwrite any CORS headers already present, e.g. from the producer.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
    }
}

pub async fn apply(State(state): State<Arc<GatewayState>>, request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    state.cors.apply(response.headers_mut());
    response
}
