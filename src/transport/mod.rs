// MIT License - Copyright (c) 2026 Peter Wright
// Broker transport abstraction

pub mod memory;
pub mod mqtt;

use crate::error::Result;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Message the broker publishes on our behalf after an abrupt disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Connection to a broker.
///
/// Shared by the connection supervisor and the dispatch loop, so every
/// operation returns within a bounded time: requests are queued rather than
/// awaited, and `check_msg` gives up after a short poll.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Open the connection, registering `will` with the broker.
    async fn connect(&mut self, will: &LastWill) -> Result<()>;

    /// One reconnection attempt after a connection issue.
    async fn reconnect(&mut self) -> Result<()>;

    /// Whether the transport has seen an error since the last (re)connect.
    fn is_conn_issue(&self) -> bool;

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Subscribe to `filter` and remember it for [`Transport::resubscribe`].
    async fn subscribe(&mut self, filter: &str) -> Result<()>;

    /// Renew every remembered subscription.
    async fn resubscribe(&mut self) -> Result<()>;

    /// One non-blocking check for an inbound message.
    async fn check_msg(&mut self) -> Result<Option<InboundMessage>>;

    /// Close the connection cleanly. The last will is not triggered.
    async fn disconnect(&mut self) -> Result<()>;
}
