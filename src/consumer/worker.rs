//! Subscription loop that persists each delivery before settling it.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::AckPolicy;
use crate::broker::{BrokerConnector, ConnectionState, Delivery};
use crate::error::BrokerError;
use crate::sink::MessageSink;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
}

/// Connect with the connector's retry budget. Exhausting it is an error
/// the consumer process exits on.
pub async fn connect_or_fail(connector: &Arc<BrokerConnector>) -> Result<(), BrokerError> {
    match connector.connect().await {
        ConnectionState::Ready => Ok(()),
        _ => {
            let err = BrokerError::RetriesExhausted {
                attempts: connector.attempts(),
            };
            error!(error = %err, queue = %connector.queue(), "Consumer cannot start without a broker");
            Err(err)
        }
    }
}

/// Consumes the connector's queue one delivery at a time.
pub struct MessageConsumer {
    connector: Arc<BrokerConnector>,
    sink: Arc<dyn MessageSink>,
    policy: AckPolicy,
    consumer_tag: String,
    prefetch: Option<u16>,
}

impl MessageConsumer {
    pub fn new(
        connector: Arc<BrokerConnector>,
        sink: Arc<dyn MessageSink>,
        policy: AckPolicy,
    ) -> Self {
        Self {
            connector,
            sink,
            policy,
            consumer_tag: format!("msgrelay-consumer-{}", Uuid::new_v4()),
            prefetch: None,
        }
    }

    /// Cap unacknowledged deliveries in flight.
    pub fn with_prefetch(mut self, prefetch: Option<u16>) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Consume until the delivery stream ends.
    ///
    /// Always returns an error: a closed stream means the broker connection
    /// is gone, and the connector is moved to `Failed` before returning.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut deliveries = self
            .connector
            .subscribe(&self.consumer_tag, self.prefetch)
            .await?;

        info!(
            queue = %self.connector.queue(),
            consumer_tag = %self.consumer_tag,
            ack_policy = %self.policy,
            "Consumer subscribed"
        );

        while let Some(item) = deliveries.next().await {
            match item {
                Ok(delivery) => {
                    self.handle(delivery).await?;
                }
                Err(e) => {
                    self.connector.mark_lost(e.clone());
                    return Err(e);
                }
            }
        }

        let err = BrokerError::ConnectionLost("delivery stream closed".to_string());
        self.connector.mark_lost(err.clone());
        Err(err)
    }

    /// Persist one delivery and settle it according to the ack policy.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, BrokerError> {
        let content = delivery.text().into_owned();
        let delivery_tag = delivery.delivery_tag;
        info!(
            delivery_tag,
            redelivered = delivery.redelivered,
            message = %content,
            "Consumed message"
        );

        match self.sink.insert(&content).await {
            Ok(record) => {
                info!(delivery_tag, id = record.id, "Inserted to PostgreSQL");
                delivery.ack().await?;
                Ok(Disposition::Acked)
            }
            Err(e) => {
                error!(delivery_tag, error = %e, "Failed to insert into DB");
                match self.policy {
                    AckPolicy::Always => {
                        warn!(delivery_tag, "Acknowledging unpersisted message");
                        delivery.ack().await?;
                        Ok(Disposition::Acked)
                    }
                    AckPolicy::AfterPersist => {
                        delivery.reject(true).await?;
                        Ok(Disposition::Requeued)
                    }
                    AckPolicy::DeadLetter => {
                        delivery.reject(false).await?;
                        Ok(Disposition::DeadLettered)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broker::memory::{MemoryBroker, RecordingClock};
    use crate::broker::{ConnectionState, QueueTopology, RetryPolicy};
    use crate::sink::MemorySink;
    use pretty_assertions::assert_eq;

    const QUEUE: &str = "test-queue";

    async fn ready_connector(broker: &MemoryBroker) -> Arc<BrokerConnector> {
        let connector = BrokerConnector::with_clock(
            Arc::new(broker.clone()),
            QueueTopology::durable(QUEUE),
            RetryPolicy::new(3, Duration::from_millis(10)),
            Arc::new(RecordingClock::default()),
        );
        assert_eq!(connector.connect().await, ConnectionState::Ready);
        connector
    }

    async fn next_delivery(connector: &BrokerConnector) -> Delivery {
        let mut stream = connector.subscribe("test", None).await.unwrap();
        stream.next().await.unwrap().unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_persists_then_acks_once() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let sink = Arc::new(MemorySink::new());
        let consumer = MessageConsumer::new(connector.clone(), sink.clone(), AckPolicy::Always);

        connector.publish(b"ping").await.unwrap();
        let disposition = consumer.handle(next_delivery(&connector).await).await.unwrap();

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(sink.rows()[0].message, "ping");
        assert_eq!(broker.acked_count(QUEUE), 1);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.redelivery_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_always_policy_acks_failed_insert() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_inserts(1);
        let consumer = MessageConsumer::new(connector.clone(), sink.clone(), AckPolicy::Always);

        connector.publish(b"lost").await.unwrap();
        let disposition = consumer.handle(next_delivery(&connector).await).await.unwrap();

        assert_eq!(disposition, Disposition::Acked);
        assert!(sink.rows().is_empty());
        assert_eq!(broker.acked_count(QUEUE), 1);
        assert_eq!(broker.ready_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_after_persist_policy_redelivers() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_inserts(1);
        let consumer = MessageConsumer::new(connector.clone(), sink.clone(), AckPolicy::AfterPersist);

        connector.publish(b"retry me").await.unwrap();
        let mut stream = connector.subscribe("test", None).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(consumer.handle(first).await.unwrap(), Disposition::Requeued);
        assert_eq!(broker.acked_count(QUEUE), 0);

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(consumer.handle(second).await.unwrap(), Disposition::Acked);

        assert_eq!(sink.rows().len(), 1);
        assert_eq!(broker.redelivery_count(QUEUE), 1);
        assert_eq!(broker.acked_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_policy() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let sink = Arc::new(MemorySink::new());
        sink.fail_next_inserts(1);
        let consumer = MessageConsumer::new(connector.clone(), sink, AckPolicy::DeadLetter);

        connector.publish(b"poison").await.unwrap();
        let disposition = consumer.handle(next_delivery(&connector).await).await.unwrap();

        assert_eq!(disposition, Disposition::DeadLettered);
        assert_eq!(broker.dead_lettered(QUEUE), vec![b"poison".to_vec()]);
        assert_eq!(broker.unacked_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_run_preserves_publish_order() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let sink = Arc::new(MemorySink::new());
        let consumer = MessageConsumer::new(connector.clone(), sink.clone(), AckPolicy::Always);

        for message in ["a", "b", "c"] {
            connector.publish(message.as_bytes()).await.unwrap();
        }
        let handle = tokio::spawn(async move { consumer.run().await });

        wait_until(|| sink.rows().len() == 3).await;
        let messages: Vec<_> = sink.rows().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert_eq!(broker.acked_count(QUEUE), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn test_run_fails_on_connection_loss() {
        let broker = MemoryBroker::new();
        let connector = ready_connector(&broker).await;
        let consumer = MessageConsumer::new(
            connector.clone(),
            Arc::new(MemorySink::new()),
            AckPolicy::Always,
        );

        let handle = tokio::spawn(async move { consumer.run().await });
        wait_until(|| broker.has_consumer(QUEUE)).await;
        broker.drop_connections("broker shutting down");

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BrokerError::ConnectionLost(_))));
        assert_eq!(connector.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_stop_consumer() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let clock = RecordingClock::default();
        let connector = BrokerConnector::with_clock(
            Arc::new(broker.clone()),
            QueueTopology::durable(QUEUE),
            RetryPolicy::new(3, Duration::from_secs(3)),
            Arc::new(clock.clone()),
        );

        assert_eq!(
            connect_or_fail(&connector).await,
            Err(BrokerError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(connector.state(), ConnectionState::Failed);
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(clock.sleeps().len(), 2);
        assert!(!broker.has_consumer(QUEUE));
    }

    #[tokio::test]
    async fn test_connect_or_fail_after_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let connector = BrokerConnector::with_clock(
            Arc::new(broker.clone()),
            QueueTopology::durable(QUEUE),
            RetryPolicy::new(10, Duration::from_secs(3)),
            Arc::new(RecordingClock::default()),
        );

        tokio_test::assert_ok!(connect_or_fail(&connector).await);
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_run_requires_ready_connector() {
        let broker = MemoryBroker::new();
        let connector = BrokerConnector::new(
            Arc::new(broker),
            QueueTopology::durable(QUEUE),
            RetryPolicy::new(1, Duration::ZERO),
        );
        let consumer = MessageConsumer::new(connector, Arc::new(MemorySink::new()), AckPolicy::Always);

        assert_eq!(consumer.run().await, Err(BrokerError::NotReady));
    }
}
