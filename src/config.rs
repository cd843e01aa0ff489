// MIT License - Copyright (c) 2026 Peter Wright
// Bridge configuration

use std::net::IpAddr;
use std::time::Duration;

use crate::constants::{
    AVAILABILITY_SUFFIX, COMMAND_SUFFIX, DEFAULT_CLIENT_ID, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_KEEPALIVE_SECS, DEFAULT_MQTT_PORT, DEFAULT_POLL_TIMEOUT_MS,
    DEFAULT_PUBLISH_INTERVAL_SECS, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_INTERVAL_MS,
    DEFAULT_SUPERVISOR_POLL_MS, STATE_SUFFIX, TREE_SUFFIX, VERSION,
};
use crate::error::{BridgeError, Result};

/// Configuration for one device bridged to one broker.
///
/// Built once at startup and moved into [`crate::Bridge::new`]; nothing in
/// the bridge reads settings from anywhere else.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// MQTT client id prefix (default: rockwren)
    pub client_id: String,
    /// Hardware-unique id of this device
    pub unique_id: String,
    /// Broker hostname or IP address
    pub broker_host: String,
    /// Broker TCP port (default: 1883)
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT keepalive in seconds (default: 15)
    pub keepalive_secs: u64,
    /// Maximum time between two state publications (default: 10)
    pub publish_interval_secs: u64,
    /// Maximum number of queued inbound commands (default: 10)
    pub queue_capacity: usize,
    /// Fixed delay between two reconnection attempts (default: 1000)
    pub retry_interval_ms: u64,
    /// Cadence of the connection liveness check (default: 1000)
    pub supervisor_poll_ms: u64,
    /// Upper bound of one non-blocking check for inbound messages (default: 10)
    pub poll_timeout_ms: u64,
    /// Time allowed for the broker to acknowledge a connection (default: 10000)
    pub connect_timeout_ms: u64,
    /// Client certificate (PEM). Together with `client_key` enables TLS.
    pub client_cert: Option<Vec<u8>>,
    /// Client private key (PEM)
    pub client_key: Option<Vec<u8>>,
    /// CA certificate (PEM) used to verify the broker when TLS is enabled
    pub ca_cert: Option<Vec<u8>>,
    /// Link to the device's own configuration page, advertised in discovery
    pub configuration_url: Option<String>,
    pub sw_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            unique_id: String::new(),
            broker_host: "localhost".to_string(),
            broker_port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            publish_interval_secs: DEFAULT_PUBLISH_INTERVAL_SECS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            supervisor_poll_ms: DEFAULT_SUPERVISOR_POLL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            client_cert: None,
            client_key: None,
            ca_cert: None,
            configuration_url: None,
            sw_version: VERSION.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// `{client_id}_{unique_id}`: MQTT client id, topic root and discovery node id.
    pub fn device_id(&self) -> String {
        format!("{}_{}", self.client_id, self.unique_id)
    }

    pub fn state_topic(&self) -> String {
        format!("{}{STATE_SUFFIX}", self.device_id())
    }

    pub fn command_topic(&self) -> String {
        format!("{}{COMMAND_SUFFIX}", self.device_id())
    }

    pub fn availability_topic(&self) -> String {
        format!("{}{AVAILABILITY_SUFFIX}", self.device_id())
    }

    /// Filter covering every topic below the device root.
    pub fn topic_tree(&self) -> String {
        format!("{}{TREE_SUFFIX}", self.device_id())
    }

    /// Whether the connection is opened over TLS with client authentication.
    ///
    /// Absence of either the certificate or the key disables the secure path.
    pub fn secure_channel(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn supervisor_poll(&self) -> Duration {
        Duration::from_millis(self.supervisor_poll_ms)
    }

    /// Check the settings the bridge cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(config_error("client_id must not be empty"));
        }
        if self.unique_id.is_empty() {
            return Err(config_error("unique_id must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(config_error("queue_capacity must be at least 1"));
        }
        if self.publish_interval_secs == 0 {
            return Err(config_error("publish_interval_secs must be at least 1"));
        }
        if !is_valid_host(&self.broker_host) {
            return Err(config_error(format!(
                "broker host {:?} is neither an IP address nor a domain name",
                self.broker_host
            )));
        }
        if self.secure_channel() && self.ca_cert.is_none() {
            return Err(config_error(
                "a CA certificate is required when a client certificate and key are configured",
            ));
        }
        Ok(())
    }
}

fn config_error(reason: impl Into<String>) -> BridgeError {
    BridgeError::Config {
        reason: reason.into(),
    }
}

/// Whether `host` is usable as a broker address: an IP literal or a domain name.
pub fn is_valid_host(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok() || is_fqdn(host)
}

/// Check that `hostname` is a syntactically valid domain name.
///
/// Each label is 1-63 characters of `[a-z0-9-]` that neither starts nor
/// ends with `-`. A single trailing dot is allowed.
pub fn is_fqdn(hostname: &str) -> bool {
    if !(2..253).contains(&hostname.len()) {
        return false;
    }
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    hostname.to_lowercase().split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Builder for BridgeConfig.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    pub fn unique_id(mut self, id: impl Into<String>) -> Self {
        self.config.unique_id = id.into();
        self
    }

    pub fn broker_host(mut self, host: impl Into<String>) -> Self {
        self.config.broker_host = host.into();
        self
    }

    pub fn broker_port(mut self, port: u16) -> Self {
        self.config.broker_port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn keepalive_secs(mut self, secs: u64) -> Self {
        self.config.keepalive_secs = secs;
        self
    }

    pub fn publish_interval_secs(mut self, secs: u64) -> Self {
        self.config.publish_interval_secs = secs;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn retry_interval_ms(mut self, ms: u64) -> Self {
        self.config.retry_interval_ms = ms;
        self
    }

    pub fn supervisor_poll_ms(mut self, ms: u64) -> Self {
        self.config.supervisor_poll_ms = ms;
        self
    }

    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn client_auth(mut self, cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        self.config.client_cert = Some(cert_pem.into());
        self.config.client_key = Some(key_pem.into());
        self
    }

    pub fn ca_cert(mut self, ca_pem: impl Into<Vec<u8>>) -> Self {
        self.config.ca_cert = Some(ca_pem.into());
        self
    }

    pub fn configuration_url(mut self, url: impl Into<String>) -> Self {
        self.config.configuration_url = Some(url.into());
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::builder().build();
        assert_eq!(config.client_id, "rockwren");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.publish_interval(), Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.supervisor_poll(), Duration::from_secs(1));
        assert!(!config.secure_channel());
    }

    #[test]
    fn test_topics_rooted_at_device_id() {
        let config = BridgeConfig::builder()
            .client_id("rockwren")
            .unique_id("e6614c311b")
            .build();
        assert_eq!(config.device_id(), "rockwren_e6614c311b");
        assert_eq!(config.state_topic(), "rockwren_e6614c311b/state");
        assert_eq!(config.command_topic(), "rockwren_e6614c311b/command");
        assert_eq!(config.availability_topic(), "rockwren_e6614c311b/LWT");
        assert_eq!(config.topic_tree(), "rockwren_e6614c311b/#");
    }

    #[test]
    fn test_secure_channel_needs_cert_and_key() {
        let mut config = BridgeConfig::builder().client_auth("cert", "key").build();
        assert!(config.secure_channel());
        config.client_key = None;
        assert!(!config.secure_channel());
        config.client_key = Some(b"key".to_vec());
        config.client_cert = None;
        assert!(!config.secure_channel());
    }

    #[test]
    fn test_validate() {
        let valid = BridgeConfig::builder()
            .unique_id("abc123")
            .broker_host("broker.local")
            .build();
        assert!(valid.validate().is_ok());

        let no_id = BridgeConfig::builder().build();
        assert!(matches!(no_id.validate(), Err(BridgeError::Config { .. })));

        let bad_host = BridgeConfig::builder()
            .unique_id("abc123")
            .broker_host("-broker")
            .build();
        assert!(bad_host.validate().is_err());

        let zero_queue = BridgeConfig::builder()
            .unique_id("abc123")
            .queue_capacity(0)
            .build();
        assert!(zero_queue.validate().is_err());

        let tls_without_ca = BridgeConfig::builder()
            .unique_id("abc123")
            .client_auth("cert", "key")
            .build();
        assert!(tls_without_ca.validate().is_err());

        let tls = BridgeConfig::builder()
            .unique_id("abc123")
            .client_auth("cert", "key")
            .ca_cert("ca")
            .build();
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_is_fqdn() {
        assert!(is_fqdn("mqtt.example.com"));
        assert!(is_fqdn("mqtt.example.com."));
        assert!(is_fqdn("Broker-1.LAN"));
        assert!(is_fqdn("homeassistant"));
        assert!(!is_fqdn("a"));
        assert!(!is_fqdn("-mqtt.example.com"));
        assert!(!is_fqdn("mqtt-.example.com"));
        assert!(!is_fqdn("mqtt..example.com"));
        assert!(!is_fqdn("mqtt_broker.example.com"));
        assert!(!is_fqdn(&format!("{}.com", "a".repeat(64))));
    }

    #[test]
    fn test_is_valid_host_accepts_ip_literals() {
        assert!(is_valid_host("192.168.1.20"));
        assert!(is_valid_host("::1"));
        assert!(!is_valid_host("192.168.1.20:1883"));
    }
}
