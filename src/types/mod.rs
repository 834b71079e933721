//! Core types for the relay services.

mod config;
mod message;

pub use config::{BrokerConfig, ConsumerConfig, GatewayConfig, ProducerConfig};
pub use message::{ConsumerHealth, InboundMessage, PersistedRecord, ProducerHealth};
