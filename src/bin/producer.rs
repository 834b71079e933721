//! Queue producer - accepts messages over HTTP and publishes them.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use msgrelay::broker::{AmqpTransport, BrokerConnector, ConnectionState};
use msgrelay::producer::{self, ProducerState};
use msgrelay::types::ProducerConfig;
use msgrelay::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = ProducerConfig::from_env();
    info!("Starting producer v{}", env!("CARGO_PKG_VERSION"));

    let transport = AmqpTransport::new(config.broker.url.clone())
        .with_publisher_confirms(config.broker.publisher_confirms);
    let connector = BrokerConnector::new(
        Arc::new(transport),
        config.broker.topology(),
        config.broker.retry_policy(),
    );

    // HTTP is served while connecting; /produce answers 503 until Ready.
    let background = connector.clone();
    tokio::spawn(async move {
        if background.connect().await != ConnectionState::Ready {
            error!("Broker unavailable; producer will keep answering 503");
        }
    });

    server::serve(producer::router(ProducerState::new(connector)), config.port).await
}
