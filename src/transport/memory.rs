// MIT License - Copyright (c) 2026 Peter Wright
// In-process broker: dry runs and tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::{Duration, sleep};
use tracing::{debug, info};

use super::{InboundMessage, LastWill, Transport};
use crate::error::{BridgeError, Result};

/// A message handed to the in-process broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct Broker {
    published: Vec<Published>,
    subscriptions: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    will: Option<LastWill>,
    connected: bool,
    conn_issue: bool,
    connect_failures: u32,
    publish_failures: u32,
    connects: u32,
    reconnect_attempts: u32,
    resubscribes: u32,
    reconnect_delay: Duration,
    yield_on_publish: bool,
}

/// Transport backed by an in-memory broker.
///
/// Clones share the same broker, so a test keeps one handle to inspect
/// traffic and script failures while the bridge owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<Broker>>,
    /// Log every publication at info level (`--dry-run`).
    log_traffic: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that logs every publication instead of sending it anywhere.
    pub fn logging() -> Self {
        Self {
            log_traffic: true,
            ..Self::default()
        }
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a message as if it arrived from the broker.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.broker().inbound.push_back(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    /// Lose the connection abruptly. The broker publishes the last will.
    pub fn drop_connection(&self) {
        let mut broker = self.broker();
        broker.connected = false;
        broker.conn_issue = true;
        if let Some(will) = broker.will.clone() {
            broker.published.push(Published {
                topic: will.topic,
                payload: will.payload,
                retain: will.retain,
            });
        }
    }

    /// Make the next `n` connect or reconnect attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.broker().connect_failures = n;
    }

    /// Make the next `n` publications fail.
    pub fn fail_publishes(&self, n: u32) {
        self.broker().publish_failures = n;
    }

    /// Make every reconnect attempt take `delay` before it resolves.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.broker().reconnect_delay = delay;
    }

    /// Yield to the scheduler inside every publish, before the message is
    /// recorded.
    pub fn yield_on_publish(&self, enabled: bool) {
        self.broker().yield_on_publish = enabled;
    }

    pub fn published(&self) -> Vec<Published> {
        self.broker().published.clone()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.broker()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.broker().published.clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.broker().subscriptions.clone()
    }

    pub fn last_will(&self) -> Option<LastWill> {
        self.broker().will.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.broker().connected
    }

    pub fn connects(&self) -> u32 {
        self.broker().connects
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.broker().reconnect_attempts
    }

    pub fn resubscribes(&self) -> u32 {
        self.broker().resubscribes
    }

    fn open(broker: &mut Broker) -> Result<()> {
        if broker.connect_failures > 0 {
            broker.connect_failures -= 1;
            return Err(BridgeError::Connection {
                details: "connection refused".to_string(),
            });
        }
        broker.connected = true;
        broker.conn_issue = false;
        Ok(())
    }
}

impl Transport for MemoryTransport {
    async fn connect(&mut self, will: &LastWill) -> Result<()> {
        let mut broker = self.broker();
        broker.connects += 1;
        broker.will = Some(will.clone());
        Self::open(&mut broker)
    }

    async fn reconnect(&mut self) -> Result<()> {
        let delay = {
            let mut broker = self.broker();
            broker.reconnect_attempts += 1;
            broker.reconnect_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut broker = self.broker();
        Self::open(&mut broker)
    }

    fn is_conn_issue(&self) -> bool {
        self.broker().conn_issue
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let pause = self.broker().yield_on_publish;
        if pause {
            tokio::task::yield_now().await;
        }
        let mut broker = self.broker();
        if !broker.connected {
            return Err(BridgeError::NotConnected);
        }
        if broker.publish_failures > 0 {
            broker.publish_failures -= 1;
            return Err(BridgeError::Client {
                details: "request rejected".to_string(),
            });
        }
        if self.log_traffic {
            info!("{topic} <- {}", String::from_utf8_lossy(payload));
        } else {
            debug!("{topic} <- {} bytes", payload.len());
        }
        broker.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        let mut broker = self.broker();
        if !broker.connected {
            return Err(BridgeError::NotConnected);
        }
        if !broker.subscriptions.iter().any(|s| s == filter) {
            broker.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn resubscribe(&mut self) -> Result<()> {
        let mut broker = self.broker();
        if !broker.connected {
            return Err(BridgeError::NotConnected);
        }
        broker.resubscribes += 1;
        Ok(())
    }

    async fn check_msg(&mut self) -> Result<Option<InboundMessage>> {
        let mut broker = self.broker();
        if !broker.connected {
            return Ok(None);
        }
        Ok(broker.inbound.pop_front())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.broker().connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn will() -> LastWill {
        LastWill {
            topic: "dev/LWT".into(),
            payload: b"offline".to_vec(),
            retain: true,
        }
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mut transport = MemoryTransport::new();
        assert!(matches!(
            transport.publish("dev/state", b"{}", false).await,
            Err(BridgeError::NotConnected)
        ));
        transport.connect(&will()).await.unwrap();
        transport.publish("dev/state", b"{}", false).await.unwrap();
        assert_eq!(transport.published_on("dev/state"), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn test_drop_connection_publishes_will() {
        let mut transport = MemoryTransport::new();
        transport.connect(&will()).await.unwrap();
        transport.drop_connection();

        assert!(transport.is_conn_issue());
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, b"offline");
        assert!(published[0].retain);

        transport.fail_connects(1);
        assert!(transport.reconnect().await.is_err());
        transport.reconnect().await.unwrap();
        assert!(!transport.is_conn_issue());
        assert_eq!(transport.reconnect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay() {
        let mut transport = MemoryTransport::new();
        transport.connect(&will()).await.unwrap();
        transport.drop_connection();
        transport.set_reconnect_delay(Duration::from_secs(8));

        let started = tokio::time::Instant::now();
        transport.reconnect().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_clones_share_broker() {
        let observer = MemoryTransport::new();
        let mut transport = observer.clone();
        transport.connect(&will()).await.unwrap();
        observer.inject("dev/command", b"{}".to_vec());

        let message = transport.check_msg().await.unwrap().unwrap();
        assert_eq!(message.topic, "dev/command");
        assert!(transport.check_msg().await.unwrap().is_none());
        assert_eq!(observer.connects(), 1);
    }
}
