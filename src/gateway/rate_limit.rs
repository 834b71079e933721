//! Fixed-window admission control for the relay route.
//!
//! One counter per process, shared by every client. The window opens on the
//! first request and resets a full window length later.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::GatewayState;
use crate::error::RelayError;

/// Counter for the current window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    pub window_start: Option<Instant>,
    pub count: u32,
    pub limit: u32,
    pub window: Duration,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u32 },
    Throttled { retry_after: Duration },
}

impl RateWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window_start: None,
            count: 0,
            limit,
            window,
        }
    }

    /// Count one request at `now` and decide whether it is admitted.
    pub fn hit(&mut self, now: Instant) -> Admission {
        let start = match self.window_start {
            Some(start) if now.duration_since(start) < self.window => start,
            _ => {
                self.window_start = Some(now);
                self.count = 0;
                now
            }
        };

        // Rejected requests still count toward the window.
        self.count = self.count.saturating_add(1);

        if self.count <= self.limit {
            Admission::Admitted {
                remaining: self.limit - self.count,
            }
        } else {
            Admission::Throttled {
                retry_after: self.window.saturating_sub(now.duration_since(start)),
            }
        }
    }
}

/// Thread-safe fixed-window limiter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Mutex<RateWindow>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window: Mutex::new(RateWindow::new(limit, window)),
        }
    }

    pub fn check(&self) -> Admission {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Admission {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hit(now)
    }
}

/// Middleware enforcing the limiter on the route it is attached to.
pub async fn enforce(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    match state.limiter.check() {
        Admission::Admitted { .. } => next.run(request).await,
        Admission::Throttled { retry_after } => {
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| request.uri().path().to_string());

            warn!(route = %route, retry_after_ms = retry_after.as_millis() as u64, "Request throttled");
            state.metrics.record_throttle(&route);

            RelayError::AdmissionRejected { route, retry_after }.into_response()
        }
    }
}
