// MIT License - Copyright (c) 2026 Peter Wright
// Topic layout, payload constants and defaults

/// Suffix of the topic the device publishes its state on.
pub const STATE_SUFFIX: &str = "/state";
/// Suffix of the topic the device receives JSON commands on.
pub const COMMAND_SUFFIX: &str = "/command";
/// Suffix of the availability (last will) topic.
pub const AVAILABILITY_SUFFIX: &str = "/LWT";
/// Wildcard suffix used to subscribe to the whole device topic tree.
pub const TREE_SUFFIX: &str = "/#";

/// Availability payloads. Both are published retained.
pub const PAYLOAD_ONLINE: &[u8] = b"online";
pub const PAYLOAD_OFFLINE: &[u8] = b"offline";

/// State payload constants shared by every on/off category.
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

/// Root of Home Assistant discovery topics.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Manufacturer reported in discovery device blocks.
pub const MANUFACTURER: &str = "Rockwren";

/// Crate version, reported as `sw_version` in discovery messages.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_CLIENT_ID: &str = "rockwren";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SUPERVISOR_POLL_MS: u64 = 1000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Capacity of the rumqttc request channel.
pub const CLIENT_REQUEST_CAPACITY: usize = 64;
/// Capacity of the bridge event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Minimum keepalive accepted by the MQTT client.
pub const MIN_KEEPALIVE_SECS: u64 = 5;
