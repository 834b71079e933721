//! Message Relay Library
//!
//! Submit -> queue -> consume -> persist pipeline split across three services:
//! a rate-limited admission gateway, a queue producer and a persisting consumer,
//! all of which reach the broker through a retrying [`BrokerConnector`].

pub mod broker;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod producer;
pub mod server;
pub mod sink;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod tests;

pub use broker::{BrokerConnector, ConnectionState, RetryPolicy};
pub use consumer::{AckPolicy, MessageConsumer};
pub use error::{BrokerError, RelayError, SinkError};
pub use gateway::GatewayState;
pub use producer::ProducerState;
pub use sink::{MessageSink, PostgresSink};

/// Durable queue shared by the producer and the consumer
pub const DEFAULT_QUEUE_NAME: &str = "test-queue";

/// Broker connection attempts before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Fixed delay between broker connection attempts (3s)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;

/// Admission window of the relay route (60s)
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Admitted requests per window
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 20;

/// Upper bound on a single relay round-trip (5s)
pub const DEFAULT_RELAY_TIMEOUT_MS: u64 = 5_000;

/// Name reported by the consumer health endpoint
pub const CONSUMER_SERVICE_NAME: &str = "lambda-consumer";
