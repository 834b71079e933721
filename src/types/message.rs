//! Payloads exchanged between client, gateway, producer and sink.

use serde::{Deserialize, Serialize};

use crate::broker::ConnectionState;
use crate::error::RelayError;

/// Body submitted by a client and relayed to the producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub message: Option<String>,
}

impl InboundMessage {
    /// Parse a request body, rejecting anything without a usable `message`.
    pub fn parse(body: &[u8]) -> Result<String, RelayError> {
        // An empty body is treated like `{}`.
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(RelayError::MissingMessage);
        }

        let inbound: InboundMessage = serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidPayload(e.to_string()))?;

        match inbound.message {
            Some(message) if !message.is_empty() => Ok(message),
            _ => Err(RelayError::MissingMessage),
        }
    }
}

/// Row written by the consumer. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PersistedRecord {
    pub id: i32,
    pub message: String,
}

/// Consumer health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumerHealth {
    pub status: String,
    pub service: String,
}

/// Producer health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProducerHealth {
    pub status: String,
    pub broker: ConnectionState,
}
