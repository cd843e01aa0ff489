// MIT License - Copyright (c) 2026 Peter Wright
// Bridge event stream

use crate::supervisor::ConnectionState;

/// Events emitted by the bridge while it runs.
///
/// Users subscribe via `bridge.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<BridgeEvent>`. Nothing in the bridge
/// depends on anyone listening.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The connection supervisor moved between states
    ConnectionStateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// A decoded command was queued for dispatch
    CommandQueued { topic: String },
    /// A command was discarded because the queue was at capacity
    CommandDropped { topic: String },
    /// An inbound payload could not be decoded and was discarded
    CommandRejected { topic: String, reason: String },
    /// A command handler ran (successfully or not)
    CommandHandled { topic: String, success: bool },
    /// The device state was published on the state topic
    StatePublished { payload: Vec<u8> },
    /// A discovery descriptor was published
    DiscoveryPublished { topic: String },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<BridgeEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<BridgeEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

/// Send an event, ignoring the case where nobody is subscribed.
pub(crate) fn emit(tx: &EventSender, event: BridgeEvent) {
    let _ = tx.send(event);
}
