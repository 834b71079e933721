//! Queue consumer: subscribe, persist, settle.

pub mod handlers;
mod worker;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use handlers::router;
pub use worker::{connect_or_fail, Disposition, MessageConsumer};

/// How a delivery is settled when its insert fails.
///
/// Successful inserts are always acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Log and ack anyway; the message is lost from the queue.
    Always,
    /// Nack with requeue so the broker redelivers it.
    AfterPersist,
    /// Nack without requeue; the broker dead-letters or drops it.
    DeadLetter,
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(AckPolicy::Always),
            "after-persist" | "after_persist" => Ok(AckPolicy::AfterPersist),
            "dead-letter" | "dead_letter" => Ok(AckPolicy::DeadLetter),
            other => Err(format!("unknown ack policy '{other}'")),
        }
    }
}

impl std::fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckPolicy::Always => write!(f, "always"),
            AckPolicy::AfterPersist => write!(f, "after-persist"),
            AckPolicy::DeadLetter => write!(f, "dead-letter"),
        }
    }
}
