//! In-process broker.
//!
//! Implements [`BrokerTransport`] with RabbitMQ-like delivery semantics:
//! messages stay owned by the queue until acked, unknown delivery tags are
//! rejected, nacked messages are requeued or dead-lettered, and dropping the
//! connection requeues everything in flight. Failures can be scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;

use super::{
    Acknowledge, BrokerSession, BrokerTransport, Clock, Delivery, DeliveryStream, LossHook,
    QueueTopology,
};
use crate::error::BrokerError;

/// Shared handle to an in-process broker. Clones see the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

#[derive(Default)]
struct BrokerInner {
    pending_connect_failures: u32,
    connect_attempts: u32,
    publish_failure: Option<String>,
    /// Bumped whenever connections are dropped; older sessions are dead.
    generation: u64,
    queues: HashMap<String, MemoryQueue>,
    loss_hooks: Vec<LossHook>,
}

#[derive(Default)]
struct MemoryQueue {
    durable: bool,
    dead_letter_exchange: Option<String>,
    published: Vec<Vec<u8>>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    next_tag: u64,
    acked: u64,
    redeliveries: u64,
    dead_lettered: Vec<Vec<u8>>,
    consumer: Option<UnboundedSender<Result<Delivery, BrokerError>>>,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().pending_connect_failures = n;
    }

    /// Make every publish fail with `reason`.
    pub fn fail_publishes(&self, reason: &str) {
        self.lock().publish_failure = Some(reason.to_string());
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Every payload ever published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn queue_is_durable(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.durable).unwrap_or(false)
    }

    pub fn dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.with_queue(queue, |q| q.dead_letter_exchange.clone())
            .flatten()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len()).unwrap_or(0)
    }

    pub fn acked_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.acked).unwrap_or(0)
    }

    pub fn redelivery_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.redeliveries).unwrap_or(0)
    }

    /// Whether a consumer is currently attached to `queue`.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.consumer.is_some())
            .unwrap_or(false)
    }

    pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.dead_lettered.clone())
            .unwrap_or_default()
    }

    /// Simulate the broker closing every connection.
    pub fn drop_connections(&self, reason: &str) {
        let hooks = {
            let mut inner = self.lock();
            inner.generation += 1;
            for queue in inner.queues.values_mut() {
                queue.consumer = None;
                let mut in_flight: Vec<_> = queue.unacked.drain().collect();
                in_flight.sort_by_key(|(tag, _)| *tag);
                for (_, mut message) in in_flight.into_iter().rev() {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            std::mem::take(&mut inner.loss_hooks)
        };

        for hook in hooks {
            hook(BrokerError::ConnectionLost(reason.to_string()));
        }
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&MemoryQueue) -> T) -> Option<T> {
        self.lock().queues.get(queue).map(f)
    }

    /// Push ready messages to the queue's consumer, if any.
    fn dispatch(&self, queue: &mut MemoryQueue, queue_name: &str) {
        while let Some(sender) = queue.consumer.as_ref() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            queue.next_tag += 1;
            let tag = queue.next_tag;
            let delivery = Delivery::new(
                tag,
                message.body.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue_name.to_string(),
                }),
            );

            if sender.unbounded_send(Ok(delivery)).is_err() {
                // Consumer went away; keep the message for the next one.
                queue.ready.push_front(message);
                queue.consumer = None;
                break;
            }
            queue.unacked.insert(tag, message);
        }
    }

    fn check_generation(inner: &BrokerInner, generation: u64) -> Result<(), BrokerError> {
        if inner.generation == generation {
            Ok(())
        } else {
            Err(BrokerError::Channel("connection closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn open(
        &self,
        topology: &QueueTopology,
        on_lost: LossHook,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let mut inner = self.lock();
        inner.connect_attempts += 1;

        if inner.pending_connect_failures > 0 {
            inner.pending_connect_failures -= 1;
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let queue = inner.queues.entry(topology.name.clone()).or_default();
        queue.durable = true;
        queue.dead_letter_exchange = topology.dead_letter_exchange.clone();
        inner.loss_hooks.push(on_lost);

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            generation: inner.generation,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    generation: u64,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut inner = self.broker.lock();
        MemoryBroker::check_generation(&inner, self.generation)?;

        if let Some(reason) = &inner.publish_failure {
            return Err(BrokerError::Publish(reason.clone()));
        }

        let target = inner.queues.entry(queue.to_string()).or_default();
        target.published.push(payload.to_vec());
        target.ready.push_back(StoredMessage {
            body: payload.to_vec(),
            redelivered: false,
        });
        self.broker.dispatch(target, queue);
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut inner = self.broker.lock();
        MemoryBroker::check_generation(&inner, self.generation)?;

        let target = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Subscribe(format!("no queue '{queue}'")))?;

        let (tx, rx) = mpsc::unbounded();
        target.consumer = Some(tx);
        self.broker.dispatch(target, queue);
        Ok(rx.boxed())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut inner = self.broker.lock();
        let queue = inner
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::Ack(format!("no queue '{}'", self.queue)))?;

        queue
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {delivery_tag}")))?;
        queue.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut inner = self.broker.lock();
        let queue = inner
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::Ack(format!("no queue '{}'", self.queue)))?;

        let mut message = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {delivery_tag}")))?;

        if requeue {
            message.redelivered = true;
            queue.redeliveries += 1;
            queue.ready.push_back(message);
            self.broker.dispatch(queue, &self.queue);
        } else {
            queue.dead_lettered.push(message.body);
        }
        Ok(())
    }
}

/// Clock that records requested sleeps and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        tokio::task::yield_now().await;
    }
}
