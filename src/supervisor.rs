// MIT License - Copyright (c) 2026 Peter Wright
// Connection lifecycle: initial connect, liveness polling, recovery

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::constants::PAYLOAD_ONLINE;
use crate::error::Result;
use crate::event::{BridgeEvent, EventSender, emit};
use crate::transport::{LastWill, Transport};

/// Broker connection state, owned by the [`ConnectionSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The transport reported an error; recovery has not started yet.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Drives the transport through connect and recovery.
///
/// Transport errors are never fatal here: every failed attempt is logged and
/// retried after `retry_interval`.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: watch::Sender<ConnectionState>,
    retry_interval: Duration,
    poll_interval: Duration,
    availability_topic: String,
    topic_tree: String,
    reconnections: AtomicU64,
    events: EventSender,
}

impl ConnectionSupervisor {
    pub fn new(config: &BridgeConfig, events: EventSender) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            retry_interval: config.retry_interval(),
            poll_interval: config.supervisor_poll(),
            availability_topic: config.availability_topic(),
            topic_tree: config.topic_tree(),
            reconnections: AtomicU64::new(0),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of successful recoveries since startup.
    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, new: ConnectionState) {
        let old = self.state.send_replace(new);
        if old != new {
            info!("Connection {old} -> {new}");
            emit(&self.events, BridgeEvent::ConnectionStateChanged { old, new });
        }
    }

    /// Initial connect: register the will, subscribe to the device topic
    /// tree and announce `online`. Retries until it succeeds.
    pub async fn establish<T: Transport>(&self, transport: &Mutex<T>, will: &LastWill) {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.open(transport, will).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "Connect failed: {e}. Retrying in {:.1}s",
                        self.retry_interval.as_secs_f64()
                    );
                    self.set_state(ConnectionState::Disconnected);
                    sleep(self.retry_interval).await;
                }
            }
        }
        self.set_state(ConnectionState::Connected);
    }

    async fn open<T: Transport>(&self, transport: &Mutex<T>, will: &LastWill) -> Result<()> {
        let mut link = transport.lock().await;
        link.connect(will).await?;
        link.subscribe(&self.topic_tree).await?;
        link.publish(&self.availability_topic, PAYLOAD_ONLINE, true).await
    }

    /// One liveness check. When the transport reports an issue, retry
    /// reconnection until it succeeds, then republish `online` and renew the
    /// subscriptions. Returns whether a recovery took place.
    pub async fn check<T: Transport>(&self, transport: &Mutex<T>) -> bool {
        if !transport.lock().await.is_conn_issue() {
            return false;
        }
        self.set_state(ConnectionState::Degraded);

        let mut attempt: u64 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            attempt += 1;
            let result = transport.lock().await.reconnect().await;
            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!("Reconnection attempt {attempt} failed: {e}");
                    sleep(self.retry_interval).await;
                }
            }
        }

        {
            let mut link = transport.lock().await;
            if let Err(e) = link.publish(&self.availability_topic, PAYLOAD_ONLINE, true).await {
                warn!("Failed to republish availability: {e}");
            }
            if let Err(e) = link.resubscribe().await {
                warn!("Failed to renew subscriptions: {e}");
            }
        }
        self.reconnections.fetch_add(1, Ordering::Relaxed);
        info!("Reconnected after {attempt} attempt(s)");
        self.set_state(ConnectionState::Connected);
        true
    }

    /// Poll the connection at a fixed cadence, forever.
    pub async fn run<T: Transport>(&self, transport: &Mutex<T>) {
        loop {
            sleep(self.poll_interval).await;
            self.check(transport).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use crate::transport::MemoryTransport;

    fn setup() -> (ConnectionSupervisor, MemoryTransport, Mutex<MemoryTransport>, LastWill) {
        let config = BridgeConfig::builder().unique_id("e6614c311b").build();
        let (tx, _) = event_channel(64);
        let supervisor = ConnectionSupervisor::new(&config, tx);
        let broker = MemoryTransport::new();
        let will = LastWill {
            topic: config.availability_topic(),
            payload: b"offline".to_vec(),
            retain: true,
        };
        (supervisor, broker.clone(), Mutex::new(broker), will)
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_retries_until_connected() {
        let (supervisor, broker, transport, will) = setup();
        broker.fail_connects(2);

        supervisor.establish(&transport, &will).await;

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(broker.connects(), 3);
        assert_eq!(broker.last_will(), Some(will));
        assert_eq!(broker.subscriptions(), vec!["rockwren_e6614c311b/#"]);
        let online = broker.published_on("rockwren_e6614c311b/LWT");
        assert_eq!(online, vec![b"online".to_vec()]);
    }

    #[tokio::test]
    async fn test_check_without_issue_is_noop() {
        let (supervisor, broker, transport, will) = setup();
        supervisor.establish(&transport, &will).await;
        assert!(!supervisor.check(&transport).await);
        assert_eq!(broker.reconnect_attempts(), 0);
        assert_eq!(supervisor.reconnections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_republishes_online_and_resubscribes_once() {
        let (supervisor, broker, transport, will) = setup();
        supervisor.establish(&transport, &will).await;
        let mut states = supervisor.subscribe_state();
        broker.clear_published();

        broker.drop_connection();
        broker.fail_connects(3);
        assert!(supervisor.check(&transport).await);

        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(broker.reconnect_attempts(), 4);
        assert_eq!(broker.resubscribes(), 1);
        assert_eq!(supervisor.reconnections(), 1);
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/LWT"),
            vec![b"offline".to_vec(), b"online".to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_emitted() {
        let config = BridgeConfig::builder().unique_id("e6614c311b").build();
        let (tx, mut rx) = event_channel(64);
        let supervisor = ConnectionSupervisor::new(&config, tx);
        let broker = MemoryTransport::new();
        let transport = Mutex::new(broker.clone());
        let will = LastWill {
            topic: config.availability_topic(),
            payload: b"offline".to_vec(),
            retain: true,
        };

        supervisor.establish(&transport, &will).await;
        broker.drop_connection();
        supervisor.check(&transport).await;

        let mut transitions = Vec::new();
        while let Ok(BridgeEvent::ConnectionStateChanged { new, .. }) = rx.try_recv() {
            transitions.push(new);
        }
        assert_eq!(
            transitions,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Degraded,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }
}
