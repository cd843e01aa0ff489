// MIT License - Copyright (c) 2026 Peter Wright
// Device to MQTT bridge with Home Assistant discovery
//
//! # rockwren-bridge
//!
//! Connects one light, switch or sensor to an MQTT broker. The bridge keeps
//! the device state published on `{client_id}_{unique_id}/state`, applies
//! JSON commands received on `.../command`, maintains `online`/`offline`
//! availability on `.../LWT` and announces the device through Home
//! Assistant MQTT discovery.
//!
//! The broker connection is supervised. When it drops, the bridge reconnects
//! at a fixed interval, then republishes its availability and renews its
//! subscriptions. Queued commands keep reaching the device during the
//! outage.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rockwren_bridge::{Bridge, BridgeConfig, Category, Device, MqttTransport, OnOffOutput};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::builder()
//!         .unique_id("e6614c311b")
//!         .broker_host("192.168.0.10")
//!         .build();
//!
//!     let device = Device::new("Desk lamp", Category::Light, OnOffOutput::new(None));
//!     let transport = MqttTransport::new(&config)?;
//!     let bridge = Bridge::new(config, device, transport)?;
//!
//!     let mut events = bridge.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     tokio::select! {
//!         _ = bridge.run() => {}
//!         _ = tokio::signal::ctrl_c() => {}
//!     }
//!     bridge.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod constants;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod event;
pub mod queue;
pub mod scheduler;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use bridge::{Bridge, CommandHandler};
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use devices::{
    Category, Device, DeviceState, DoorSensor, OnOffOutput, SharedDevice, StatefulDevice,
    TemperatureSensor,
};
pub use discovery::{DiscoveryContext, DiscoveryRegistry};
pub use error::{BridgeError, Result};
pub use event::{BridgeEvent, EventReceiver};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use transport::{InboundMessage, LastWill, MemoryTransport, MqttTransport, Transport};
