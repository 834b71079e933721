//! Broker connector with bounded, fixed-interval reconnection.
//!
//! The retry loop is split in two: [`ReconnectMachine`] is a pure transition
//! function over [`ConnectionState`], and [`BrokerConnector::connect`] drives
//! it against a [`BrokerTransport`] and a [`Clock`]. Tests swap both.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{BrokerSession, BrokerTransport, DeliveryStream, LossHook, QueueTopology};
use crate::error::BrokerError;

/// Connection lifecycle of one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Fixed retry count and fixed delay. No jitter, no exponential growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Inputs to the reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// Begin (or resume) connecting
    Start,
    AttemptSucceeded,
    AttemptFailed,
    /// An established connection went away
    ConnectionLost,
}

/// What the driver should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Attempt,
    RetryAfter(Duration),
    Ready,
    GiveUp,
    /// Event does not apply in the current state
    Ignore,
}

/// Pure reconnect state machine.
///
/// Every attempt passes through `Connecting`; `Failed` is left only by
/// another `Start` while retries remain. A loss reported while an attempt
/// is still `Connecting` fails that attempt once it completes.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: RetryPolicy,
    state: ConnectionState,
    attempts: u32,
    lost_while_connecting: bool,
}

impl ReconnectMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            lost_while_connecting: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attempts made in the current connect cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transition(&mut self, event: ConnectorEvent) -> Next {
        use ConnectionState::*;
        use ConnectorEvent::*;

        match (self.state, event) {
            (Disconnected, Start) => {
                self.attempts = 1;
                self.lost_while_connecting = false;
                self.state = Connecting;
                Next::Attempt
            }
            (Failed, Start) if self.attempts < self.policy.max_retries => {
                self.attempts += 1;
                self.lost_while_connecting = false;
                self.state = Connecting;
                Next::Attempt
            }
            (Failed, Start) => Next::GiveUp,
            (Connecting, ConnectionLost) => {
                self.lost_while_connecting = true;
                Next::Ignore
            }
            (Connecting, AttemptSucceeded) if self.lost_while_connecting => {
                self.lost_while_connecting = false;
                self.fail_attempt()
            }
            (Connecting, AttemptSucceeded) => {
                self.state = Ready;
                Next::Ready
            }
            (Connecting, AttemptFailed) => self.fail_attempt(),
            (Ready, ConnectionLost) => {
                self.state = Failed;
                // A later connect cycle gets a fresh budget.
                self.attempts = 0;
                Next::GiveUp
            }
            _ => Next::Ignore,
        }
    }

    fn fail_attempt(&mut self) -> Next {
        self.state = ConnectionState::Failed;
        if self.attempts < self.policy.max_retries {
            Next::RetryAfter(self.policy.delay)
        } else {
            Next::GiveUp
        }
    }
}

/// Source of retry delays.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Owns one broker connection and its state.
///
/// Publish and subscribe are only served in [`ConnectionState::Ready`];
/// otherwise they fail fast with [`BrokerError::NotReady`].
pub struct BrokerConnector {
    transport: Arc<dyn BrokerTransport>,
    topology: QueueTopology,
    clock: Arc<dyn Clock>,
    machine: Mutex<ReconnectMachine>,
    state_tx: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
}

impl BrokerConnector {
    /// Create a connector that sleeps on the tokio timer between attempts.
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        topology: QueueTopology,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Self::with_clock(transport, topology, policy, Arc::new(TokioClock))
    }

    pub fn with_clock(
        transport: Arc<dyn BrokerTransport>,
        topology: QueueTopology,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            topology,
            clock,
            machine: Mutex::new(ReconnectMachine::new(policy)),
            state_tx,
            session: RwLock::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn attempts(&self) -> u32 {
        self.machine().attempts()
    }

    pub fn queue(&self) -> &str {
        &self.topology.name
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the connector enters `Failed`.
    pub async fn wait_for_failure(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|s| *s == ConnectionState::Failed).await;
    }

    /// Connect with bounded retries. Returns `Ready` or `Failed`.
    pub async fn connect(self: &Arc<Self>) -> ConnectionState {
        let max_retries = self.machine().policy.max_retries;
        let mut next = self.apply(ConnectorEvent::Start);

        loop {
            match next {
                Next::Attempt => {
                    let attempt = self.attempts();
                    info!(queue = %self.topology.name, attempt, max_retries, "Connecting to broker");

                    match self.transport.open(&self.topology, self.loss_hook()).await {
                        Ok(session) => {
                            // Session must be in place before anyone observes Ready.
                            *self.session_slot_mut() = Some(session);
                            next = self.apply(ConnectorEvent::AttemptSucceeded);
                            if next != Next::Ready {
                                self.session_slot_mut().take();
                                warn!(attempt, max_retries, "Broker connection lost while connecting");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, attempt, max_retries, "Broker connection attempt failed");
                            next = self.apply(ConnectorEvent::AttemptFailed);
                        }
                    }
                }
                Next::RetryAfter(delay) => {
                    info!(delay_ms = delay.as_millis() as u64, "Retrying broker connection");
                    self.clock.sleep(delay).await;
                    next = self.apply(ConnectorEvent::Start);
                }
                Next::Ready => {
                    info!(queue = %self.topology.name, "Connected to broker and queue asserted");
                    return ConnectionState::Ready;
                }
                Next::GiveUp => {
                    error!(attempts = self.attempts(), "Could not connect to broker after retries");
                    return self.state();
                }
                Next::Ignore => return self.state(),
            }
        }
    }

    /// Record loss of an established connection.
    pub fn mark_lost(&self, err: BrokerError) {
        if self.apply(ConnectorEvent::ConnectionLost) == Next::GiveUp {
            self.session_slot_mut().take();
            error!(error = %err, queue = %self.topology.name, "Broker connection lost");
        }
    }

    /// Publish a persistent message to the connector's queue.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let session = self.ready_session()?;
        session.publish(&self.topology.name, payload).await
    }

    pub async fn subscribe(
        &self,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BrokerError> {
        let session = self.ready_session()?;
        session
            .subscribe(&self.topology.name, consumer_tag, prefetch)
            .await
    }

    fn ready_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if !self.is_ready() {
            return Err(BrokerError::NotReady);
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotReady)
    }

    fn apply(&self, event: ConnectorEvent) -> Next {
        let mut machine = self.machine();
        let next = machine.transition(event);
        self.state_tx.send_replace(machine.state());
        next
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, ReconnectMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn BrokerSession>>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn loss_hook(self: &Arc<Self>) -> LossHook {
        let weak = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(connector) = weak.upgrade() {
                connector.mark_lost(err);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, RecordingClock};
    use pretty_assertions::assert_eq;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(3000))
    }

    fn connector(broker: &MemoryBroker, clock: &RecordingClock, max_retries: u32) -> Arc<BrokerConnector> {
        BrokerConnector::with_clock(
            Arc::new(broker.clone()),
            QueueTopology::durable("test-queue"),
            policy(max_retries),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_machine_passes_through_connecting() {
        let mut machine = ReconnectMachine::new(policy(3));
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        assert_eq!(machine.transition(ConnectorEvent::AttemptSucceeded), Next::Ignore);
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        assert_eq!(machine.transition(ConnectorEvent::Start), Next::Attempt);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        assert_eq!(
            machine.transition(ConnectorEvent::AttemptFailed),
            Next::RetryAfter(Duration::from_millis(3000))
        );
        assert_eq!(machine.state(), ConnectionState::Failed);

        assert_eq!(machine.transition(ConnectorEvent::Start), Next::Attempt);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        assert_eq!(machine.transition(ConnectorEvent::AttemptSucceeded), Next::Ready);
        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(machine.attempts(), 2);
    }

    #[test]
    fn test_machine_gives_up_after_budget() {
        let mut machine = ReconnectMachine::new(policy(2));
        machine.transition(ConnectorEvent::Start);
        machine.transition(ConnectorEvent::AttemptFailed);
        machine.transition(ConnectorEvent::Start);

        assert_eq!(machine.transition(ConnectorEvent::AttemptFailed), Next::GiveUp);
        assert_eq!(machine.transition(ConnectorEvent::Start), Next::GiveUp);
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(machine.attempts(), 2);
    }

    #[test]
    fn test_machine_loss_only_from_ready() {
        let mut machine = ReconnectMachine::new(policy(2));
        assert_eq!(machine.transition(ConnectorEvent::ConnectionLost), Next::Ignore);

        machine.transition(ConnectorEvent::Start);
        machine.transition(ConnectorEvent::AttemptSucceeded);
        assert_eq!(machine.transition(ConnectorEvent::ConnectionLost), Next::GiveUp);
        assert_eq!(machine.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_machine_loss_during_attempt_fails_it() {
        let mut machine = ReconnectMachine::new(policy(2));
        machine.transition(ConnectorEvent::Start);

        assert_eq!(machine.transition(ConnectorEvent::ConnectionLost), Next::Ignore);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        assert_eq!(
            machine.transition(ConnectorEvent::AttemptSucceeded),
            Next::RetryAfter(Duration::from_millis(3000))
        );
        assert_eq!(machine.state(), ConnectionState::Failed);

        // The next attempt starts clean.
        assert_eq!(machine.transition(ConnectorEvent::Start), Next::Attempt);
        assert_eq!(machine.transition(ConnectorEvent::AttemptSucceeded), Next::Ready);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_retries(), 1);
    }

    #[tokio::test]
    async fn test_connect_after_two_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let clock = RecordingClock::default();
        let connector = connector(&broker, &clock, 10);

        assert_eq!(connector.connect().await, ConnectionState::Ready);
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(connector.attempts(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(3000), Duration::from_millis(3000)]
        );
        assert!(broker.queue_is_durable("test-queue"));
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let clock = RecordingClock::default();
        let connector = connector(&broker, &clock, 4);

        assert_eq!(connector.connect().await, ConnectionState::Failed);
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(clock.sleeps().len(), 3);
        assert_eq!(
            connector.publish(b"hello").await,
            Err(BrokerError::NotReady)
        );
        assert!(broker.published("test-queue").is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_connector() {
        let broker = MemoryBroker::new();
        let clock = RecordingClock::default();
        let connector = connector(&broker, &clock, 3);
        assert_eq!(connector.connect().await, ConnectionState::Ready);

        let mut rx = connector.watch();
        broker.drop_connections("broker restarted");

        rx.wait_for(|s| *s == ConnectionState::Failed).await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Failed);
        assert_eq!(connector.publish(b"late").await, Err(BrokerError::NotReady));
    }

    #[tokio::test]
    async fn test_publish_when_ready() {
        let broker = MemoryBroker::new();
        let clock = RecordingClock::default();
        let connector = connector(&broker, &clock, 3);
        connector.connect().await;

        tokio_test::assert_ok!(connector.publish(b"hello").await);
        assert_eq!(broker.published("test-queue"), vec![b"hello".to_vec()]);
        assert!(clock.sleeps().is_empty());
    }

    /// Drops every connection right after the first `open` succeeds, so the
    /// loss hook fires before the connector has seen the attempt complete.
    struct DropsFirstSession {
        broker: MemoryBroker,
        opened: Mutex<u32>,
    }

    #[async_trait]
    impl BrokerTransport for DropsFirstSession {
        async fn open(
            &self,
            topology: &QueueTopology,
            on_lost: LossHook,
        ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
            let session = self.broker.open(topology, on_lost).await?;
            let first = {
                let mut opened = self.opened.lock().unwrap();
                *opened += 1;
                *opened == 1
            };
            if first {
                self.broker.drop_connections("closed during handshake");
            }
            Ok(session)
        }
    }

    fn dropping_connector(broker: &MemoryBroker, clock: &RecordingClock, max_retries: u32) -> Arc<BrokerConnector> {
        BrokerConnector::with_clock(
            Arc::new(DropsFirstSession {
                broker: broker.clone(),
                opened: Mutex::new(0),
            }),
            QueueTopology::durable("test-queue"),
            policy(max_retries),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_loss_during_connect_is_not_ready() {
        let broker = MemoryBroker::new();
        let clock = RecordingClock::default();
        let connector = dropping_connector(&broker, &clock, 1);

        assert_eq!(connector.connect().await, ConnectionState::Failed);
        assert_eq!(connector.publish(b"hello").await, Err(BrokerError::NotReady));
        assert!(broker.published("test-queue").is_empty());
    }

    #[tokio::test]
    async fn test_loss_during_connect_retries() {
        let broker = MemoryBroker::new();
        let clock = RecordingClock::default();
        let connector = dropping_connector(&broker, &clock, 3);

        assert_eq!(connector.connect().await, ConnectionState::Ready);
        assert_eq!(connector.attempts(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(3000)]);
        tokio_test::assert_ok!(connector.publish(b"hello").await);
    }
}
