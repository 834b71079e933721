//! Admission gateway - rate-limited relay in front of the producer.

use anyhow::Result;
use tracing::info;

use msgrelay::gateway::{self, GatewayState};
use msgrelay::types::GatewayConfig;
use msgrelay::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = GatewayConfig::from_env();
    info!("Starting API Gateway v{}", env!("CARGO_PKG_VERSION"));

    let port = config.port;
    let state = GatewayState::new(config)?;

    server::serve(gateway::router(state), port).await
}
