//! RabbitMQ transport for the broker connector.
//!
//! One connection and one channel per session; the channel is reused for
//! every publish and subscription of the owning process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, instrument};

use super::{
    Acknowledge, BrokerSession, BrokerTransport, Delivery, DeliveryStream, LossHook,
    QueueTopology,
};
use crate::error::BrokerError;

/// Persistent delivery mode (survives broker restart).
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Opens AMQP connections to a single broker URL.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    url: String,
    publisher_confirms: bool,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publisher_confirms: false,
        }
    }

    /// Wait for a broker confirm on every publish.
    pub fn with_publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }
}

fn queue_arguments(topology: &QueueTopology) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &topology.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    arguments
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    #[instrument(skip(self, on_lost), fields(queue = %topology.name))]
    async fn open(
        &self,
        topology: &QueueTopology,
        on_lost: LossHook,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }

        channel
            .queue_declare(
                &topology.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(topology),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: topology.name.clone(),
                reason: e.to_string(),
            })?;

        // Registered last so a half-built attempt never reports a loss.
        connection.on_error(move |err| on_lost(BrokerError::ConnectionLost(err.to_string())));

        info!(confirms = self.publisher_confirms, "AMQP channel open");

        Ok(Arc::new(AmqpSession {
            _connection: connection,
            channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }
}

struct AmqpSession {
    // Held so the connection outlives the channel.
    _connection: Connection,
    channel: Channel,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type("application/octet-stream".into());

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if !self.publisher_confirms {
            return Ok(());
        }

        match confirm
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
        {
            Confirmation::Nack(_) => Err(BrokerError::Nacked),
            _ => {
                debug!(queue = %queue, "Publish confirmed");
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BrokerError> {
        if let Some(count) = prefetch {
            self.channel
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
        });

        Ok(stream.boxed())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
