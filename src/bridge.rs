// MIT License - Copyright (c) 2026 Peter Wright
// Device-broker bridge: composition, dispatch loop, lifecycle

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::constants::{EVENT_CHANNEL_CAPACITY, PAYLOAD_OFFLINE};
use crate::devices::{Device, SharedDevice};
use crate::discovery::{DiscoveryContext, DiscoveryRegistry, default_discovery};
use crate::error::{BridgeError, Result};
use crate::event::{BridgeEvent, EventReceiver, EventSender, emit, event_channel};
use crate::queue::{CommandQueue, PendingCommand};
use crate::scheduler::{DirtyFlag, PublicationScheduler};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::transport::{InboundMessage, LastWill, Transport};

/// Handles a decoded command for one topic.
pub type CommandHandler = Box<dyn Fn(&mut Device, &str, &Value) -> Result<()> + Send + Sync>;

struct TopicHandler {
    topic: String,
    name: String,
    handler: CommandHandler,
}

/// Name of the handler that feeds the command topic to the device.
pub const DEVICE_COMMAND_HANDLER: &str = "command_handler";

/// Bridges one device to one broker.
///
/// `run` joins two loops on the calling task: the connection supervisor and
/// the dispatch loop. Both only hold a lock for one bounded step.
pub struct Bridge<T: Transport> {
    config: BridgeConfig,
    device: SharedDevice,
    transport: Mutex<T>,
    queue: Mutex<CommandQueue>,
    scheduler: Mutex<PublicationScheduler>,
    dirty: DirtyFlag,
    handlers: Vec<TopicHandler>,
    discovery: DiscoveryRegistry,
    supervisor: ConnectionSupervisor,
    events: EventSender,
    idle_pause: Duration,
}

impl<T: Transport> Bridge<T> {
    /// Wire `device` to `transport`.
    ///
    /// Registers the device command handler on the command topic and the
    /// device's discovery descriptors (or the default one when it declares
    /// none).
    pub fn new(config: BridgeConfig, mut device: Device, transport: T) -> Result<Self> {
        config.validate()?;

        let (events, _) = event_channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = PublicationScheduler::new(config.publish_interval());
        let dirty = scheduler.dirty_flag();

        let listener_flag = dirty.clone();
        device.register_listener(move || {
            listener_flag.mark();
            Ok(())
        });

        let mut discovery = DiscoveryRegistry::new();
        let ctx = DiscoveryContext::new(&config, device.name(), device.category());
        let declared = device.discovery(&ctx);
        if declared.is_empty() {
            discovery.register(device.category().as_str(), default_discovery);
        }
        for (category, descriptor) in declared {
            discovery.register(category, move |_: &DiscoveryContext| descriptor.clone());
        }

        let mut bridge = Self {
            queue: Mutex::new(CommandQueue::new(config.queue_capacity)),
            scheduler: Mutex::new(scheduler),
            dirty,
            handlers: Vec::new(),
            discovery,
            supervisor: ConnectionSupervisor::new(&config, events.clone()),
            events,
            idle_pause: Duration::from_millis(config.poll_timeout_ms.max(1)),
            device: Arc::new(Mutex::new(device)),
            transport: Mutex::new(transport),
            config,
        };
        let command_topic = bridge.config.command_topic();
        bridge.register_topic_handler(command_topic, DEVICE_COMMAND_HANDLER, |device, topic, message| {
            device.handle_command(topic, message)
        });
        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The bridged device, for hardware tasks that drive its state.
    pub fn device(&self) -> SharedDevice {
        self.device.clone()
    }

    pub fn transport(&self) -> &Mutex<T> {
        &self.transport
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Route decoded messages on `topic` to `handler`. Only topics with a
    /// handler are queued.
    pub fn register_topic_handler<F>(&mut self, topic: impl Into<String>, name: &str, handler: F)
    where
        F: Fn(&mut Device, &str, &Value) -> Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        self.handlers.retain(|h| h.topic != topic);
        self.handlers.push(TopicHandler {
            topic,
            name: name.to_string(),
            handler: Box::new(handler),
        });
    }

    /// Add or replace a discovery generator.
    pub fn register_discovery<F>(&mut self, category: impl Into<String>, generator: F)
    where
        F: Fn(&DiscoveryContext) -> Value + Send + Sync + 'static,
    {
        self.discovery.register(category, generator);
    }

    pub fn discovery(&self) -> &DiscoveryRegistry {
        &self.discovery
    }

    pub async fn discovery_context(&self) -> DiscoveryContext {
        let device = self.device.lock().await;
        DiscoveryContext::new(&self.config, device.name(), device.category())
    }

    /// Device summary plus broker and topic layout.
    pub async fn information(&self) -> Value {
        let mut info = self.device.lock().await.information();
        info["mqtt"] = json!({
            "broker": format!("{}:{}", self.config.broker_host, self.config.broker_port),
            "device_id": self.config.device_id(),
            "state_topic": self.config.state_topic(),
            "command_topic": self.config.command_topic(),
            "availability_topic": self.config.availability_topic(),
            "secure": self.config.secure_channel(),
        });
        info
    }

    /// Connect, then publish every discovery descriptor.
    pub async fn start(&self) {
        let will = LastWill {
            topic: self.config.availability_topic(),
            payload: PAYLOAD_OFFLINE.to_vec(),
            retain: true,
        };
        self.supervisor.establish(&self.transport, &will).await;

        let ctx = self.discovery_context().await;
        let mut transport = self.transport.lock().await;
        self.discovery
            .emit_all(&mut *transport, &ctx, &self.events)
            .await;
    }

    /// Start, then supervise and dispatch until the future is dropped.
    pub async fn run(&self) {
        self.start().await;
        info!("Bridge running for {}", self.config.device_id());
        tokio::join!(self.supervisor.run(&self.transport), self.run_dispatch());
    }

    /// The dispatch loop: one [`Bridge::dispatch_turn`] per scheduling turn.
    pub async fn run_dispatch(&self) {
        loop {
            if self.dispatch_turn().await {
                tokio::task::yield_now().await;
            } else {
                sleep(self.idle_pause).await;
            }
        }
    }

    /// One pass of the dispatch loop. Returns whether anything happened.
    ///
    /// 1. check once for an inbound message and queue it
    /// 2. publish the state when dirty or the interval elapsed
    /// 3. take the oldest queued command
    /// 4. run its topic handler, isolating errors and panics
    /// 5. republish the state
    ///
    /// The transport is only borrowed if it is free. While the supervisor
    /// holds it for a reconnect, the broker steps are skipped and queued
    /// commands still reach the device.
    pub async fn dispatch_turn(&self) -> bool {
        let inbound = match self.transport.try_lock() {
            Ok(mut transport) => transport.check_msg().await,
            Err(_) => Ok(None),
        };
        let mut busy = match inbound {
            Ok(Some(message)) => {
                self.on_message(message).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Inbound check failed: {e}");
                false
            }
        };

        let due = self.scheduler.lock().await.is_due(Instant::now());
        if due {
            busy |= self.publish_state().await;
        }

        let Some(command) = self.queue.lock().await.pop() else {
            return busy;
        };
        self.handle(&command).await;
        self.publish_state().await;
        true
    }

    /// Decode an inbound message and queue it if a handler wants its topic.
    pub async fn on_message(&self, message: InboundMessage) {
        if !self.handlers.iter().any(|h| h.topic == message.topic) {
            debug!("Ignoring message on {}", message.topic);
            return;
        }
        let decoded: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding undecodable message on {}: {e}", message.topic);
                emit(
                    &self.events,
                    BridgeEvent::CommandRejected {
                        topic: message.topic,
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };

        let topic = message.topic;
        let pushed = self.queue.lock().await.push(PendingCommand {
            topic: topic.clone(),
            message: decoded,
        });
        match pushed {
            Ok(()) => {
                debug!("Queued command on {topic}");
                emit(&self.events, BridgeEvent::CommandQueued { topic });
            }
            Err(_) => emit(&self.events, BridgeEvent::CommandDropped { topic }),
        }
    }

    async fn handle(&self, command: &PendingCommand) {
        let Some(entry) = self.handlers.iter().find(|h| h.topic == command.topic) else {
            warn!("No handler for {}", command.topic);
            return;
        };

        let mut device = self.device.lock().await;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (entry.handler)(&mut *device, &command.topic, &command.message)
        }))
        .unwrap_or_else(|_| Err(BridgeError::handler(&entry.name, "panicked")));
        drop(device);

        let success = match outcome {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Handler {} failed for message on {}: {e}",
                    entry.name, command.topic
                );
                false
            }
        };
        emit(
            &self.events,
            BridgeEvent::CommandHandled {
                topic: command.topic.clone(),
                success,
            },
        );
    }

    /// Publish the current state on the state topic.
    ///
    /// The dirty flag is cleared before the state is read, so a change that
    /// lands during the publication leaves it set. Skipped while the
    /// transport is busy or reports a connection issue; the state stays dirty
    /// so the first turn after recovery publishes it. Returns whether the
    /// state was published.
    pub async fn publish_state(&self) -> bool {
        self.dirty.take();
        let payload = match self.device.lock().await.serialize_state() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize state: {e}");
                self.dirty.mark();
                return false;
            }
        };
        let topic = self.config.state_topic();

        let result = {
            let Ok(mut transport) = self.transport.try_lock() else {
                self.dirty.mark();
                return false;
            };
            if transport.is_conn_issue() {
                self.dirty.mark();
                return false;
            }
            transport.publish(&topic, &payload, false).await
        };

        match result {
            Ok(()) => {
                self.scheduler.lock().await.record_publish(Instant::now());
                debug!("Published state {}", String::from_utf8_lossy(&payload));
                emit(&self.events, BridgeEvent::StatePublished { payload });
                true
            }
            Err(e) => {
                warn!("State publish failed: {e}");
                self.dirty.mark();
                false
            }
        }
    }

    /// Number of commands waiting for dispatch.
    pub async fn queued_commands(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Number of commands dropped because the queue was full.
    pub async fn dropped_commands(&self) -> u64 {
        self.queue.lock().await.dropped()
    }

    /// Announce `offline` and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if !transport.is_conn_issue() {
            if let Err(e) = transport
                .publish(&self.config.availability_topic(), PAYLOAD_OFFLINE, true)
                .await
            {
                warn!("Failed to publish offline availability: {e}");
            }
        }
        let result = transport.disconnect().await;
        self.supervisor.set_state(ConnectionState::Disconnected);
        info!("Bridge for {} stopped", self.config.device_id());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Category, OnOffOutput};
    use crate::transport::MemoryTransport;

    fn bridge() -> (Bridge<MemoryTransport>, MemoryTransport) {
        let config = BridgeConfig::builder().unique_id("e6614c311b").build();
        let device = Device::new("Lamp", Category::Light, OnOffOutput::default());
        let broker = MemoryTransport::new();
        (Bridge::new(config, device, broker.clone()).unwrap(), broker)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BridgeConfig::builder().build();
        let device = Device::new("Lamp", Category::Light, OnOffOutput::default());
        assert!(Bridge::new(config, device, MemoryTransport::new()).is_err());
    }

    #[test]
    fn test_default_discovery_registered() {
        let (bridge, _) = bridge();
        let categories: Vec<_> = bridge.discovery().categories().collect();
        assert_eq!(categories, vec!["light"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_not_queued() {
        let (bridge, _) = bridge();
        let mut events = bridge.subscribe();
        bridge
            .on_message(InboundMessage {
                topic: "rockwren_e6614c311b/command".into(),
                payload: b"{not json".to_vec(),
            })
            .await;
        assert_eq!(bridge.queued_commands().await, 0);
        assert!(matches!(
            events.try_recv(),
            Ok(BridgeEvent::CommandRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_unhandled_topics_ignored() {
        let (bridge, _) = bridge();
        bridge
            .on_message(InboundMessage {
                topic: "rockwren_e6614c311b/state".into(),
                payload: br#"{"state":"ON"}"#.to_vec(),
            })
            .await;
        assert_eq!(bridge.queued_commands().await, 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let (mut bridge, broker) = bridge();
        bridge.register_topic_handler("rockwren_e6614c311b/command", "exploding", |_, _, _| {
            panic!("handler bug")
        });
        bridge.start().await;
        broker.clear_published();
        let mut events = bridge.subscribe();

        broker.inject("rockwren_e6614c311b/command", br#"{"state":"ON"}"#.to_vec());
        assert!(bridge.dispatch_turn().await);

        let handled = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| matches!(e, BridgeEvent::CommandHandled { .. }));
        assert_eq!(
            handled,
            Some(BridgeEvent::CommandHandled {
                topic: "rockwren_e6614c311b/command".into(),
                success: false,
            })
        );
        // State is still republished after the failed handler
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/state").last(),
            Some(&br#"{"state":"OFF"}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_publish_skipped_during_connection_issue() {
        let (bridge, broker) = bridge();
        bridge.start().await;
        bridge.dispatch_turn().await;
        broker.drop_connection();
        broker.clear_published();

        bridge.device().lock().await.on().unwrap();
        assert!(!bridge.publish_state().await);
        assert!(broker.published_on("rockwren_e6614c311b/state").is_empty());
        assert!(bridge.dirty.is_set());

        bridge.supervisor().check(bridge.transport()).await;
        bridge.dispatch_turn().await;
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/state"),
            vec![br#"{"state":"ON"}"#.to_vec()]
        );
    }

    #[tokio::test]
    async fn test_change_during_publish_stays_dirty() {
        let (bridge, broker) = bridge();
        bridge.start().await;
        broker.yield_on_publish(true);

        let device = bridge.device();
        let (published, _) = tokio::join!(bridge.publish_state(), async {
            device.lock().await.on().unwrap();
        });
        assert!(published);
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/state"),
            vec![br#"{"state":"OFF"}"#.to_vec()]
        );
        assert!(bridge.dirty.is_set());

        assert!(bridge.dispatch_turn().await);
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/state").last(),
            Some(&br#"{"state":"ON"}"#.to_vec())
        );
        assert!(!bridge.dirty.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_dispatched_while_reconnecting() {
        let (bridge, broker) = bridge();
        bridge.start().await;
        bridge.dispatch_turn().await;

        broker.drop_connection();
        broker.set_reconnect_delay(Duration::from_secs(8));
        bridge
            .on_message(InboundMessage {
                topic: "rockwren_e6614c311b/command".into(),
                payload: br#"{"state":"ON"}"#.to_vec(),
            })
            .await;

        let (recovered, (elapsed, on)) = tokio::join!(
            bridge.supervisor().check(bridge.transport()),
            async {
                let started = Instant::now();
                assert!(bridge.dispatch_turn().await);
                (started.elapsed(), bridge.device().lock().await.is_on())
            }
        );
        assert!(recovered);
        assert!(on);
        assert!(elapsed < Duration::from_secs(1));
        assert!(bridge.dirty.is_set());

        bridge.dispatch_turn().await;
        assert_eq!(
            broker.published_on("rockwren_e6614c311b/state").last(),
            Some(&br#"{"state":"ON"}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_shutdown_publishes_offline() {
        let (bridge, broker) = bridge();
        bridge.start().await;
        bridge.shutdown().await.unwrap();

        assert_eq!(
            broker.published_on("rockwren_e6614c311b/LWT").last(),
            Some(&b"offline".to_vec())
        );
        assert!(!broker.is_connected());
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_information() {
        let (bridge, _) = bridge();
        let info = bridge.information().await;
        assert_eq!(info["name"], "Lamp");
        assert_eq!(info["type"], "light");
        assert_eq!(info["mqtt"]["command_topic"], "rockwren_e6614c311b/command");
        assert_eq!(info["mqtt"]["broker"], "localhost:1883");
    }
}
