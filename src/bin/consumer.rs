//! Queue consumer - persists every message to PostgreSQL.
//!
//! Exits non-zero when the broker cannot be reached or the connection is
//! lost; restarting is left to the supervisor.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use msgrelay::broker::{AmqpTransport, BrokerConnector};
use msgrelay::consumer::{self, MessageConsumer};
use msgrelay::types::ConsumerConfig;
use msgrelay::{server, telemetry, PostgresSink};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = ConsumerConfig::from_env();
    info!(
        ack_policy = %config.ack_policy,
        "Starting consumer v{}",
        env!("CARGO_PKG_VERSION")
    );

    let sink = PostgresSink::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let health = tokio::spawn(server::serve(consumer::router(), config.port));

    let connector = BrokerConnector::new(
        Arc::new(AmqpTransport::new(config.broker.url.clone())),
        config.broker.topology(),
        config.broker.retry_policy(),
    );

    consumer::connect_or_fail(&connector).await?;

    let worker = MessageConsumer::new(connector.clone(), Arc::new(sink), config.ack_policy)
        .with_prefetch(config.broker.prefetch);

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                error!(error = %e, "Consumer stopped");
                return Err(e.into());
            }
        }
        _ = connector.wait_for_failure() => {
            bail!("Broker connection lost");
        }
        result = health => {
            result.context("health server task panicked")??;
            info!("Health server stopped, shutting down consumer");
        }
    }

    Ok(())
}
