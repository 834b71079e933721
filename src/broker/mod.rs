//! # Broker Module
//!
//! Everything the producer and consumer need to talk to the message broker.
//!
//! ## Layout
//! - [`BrokerTransport`] / [`BrokerSession`]: the seam between the connector
//!   and a concrete broker client
//! - [`connector`]: retrying connector with an explicit connection state machine
//! - [`amqp`]: RabbitMQ adapter built on `lapin`
//! - [`memory`]: in-process broker used by tests

pub mod amqp;
pub mod connector;
pub mod memory;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;

pub use amqp::AmqpTransport;
pub use connector::{
    BrokerConnector, Clock, ConnectionState, ConnectorEvent, Next, ReconnectMachine, RetryPolicy,
    TokioClock,
};

/// Called by a transport when an established connection goes away.
pub type LossHook = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Stream of deliveries for one subscription. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub name: String,
    pub dead_letter_exchange: Option<String>,
}

impl QueueTopology {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_exchange: None,
        }
    }
}

/// Opens sessions against a broker: connection, channel and durable queue.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Run one connection attempt. `on_lost` must only be wired up once the
    /// whole attempt has succeeded.
    async fn open(
        &self,
        topology: &QueueTopology,
        on_lost: LossHook,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// An open channel with its queue asserted.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BrokerError>;
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to the consumer, owned by the broker until settled.
///
/// Settling consumes the delivery, so it can be acknowledged at most once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Payload decoded as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Negatively acknowledge. With `requeue == false` the broker drops the
    /// message or routes it to the queue's dead-letter exchange.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
