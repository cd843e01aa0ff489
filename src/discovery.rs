// MIT License - Copyright (c) 2026 Peter Wright
// Home Assistant MQTT discovery registry

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::constants::{DISCOVERY_PREFIX, MANUFACTURER, PAYLOAD_OFF, PAYLOAD_ON};
use crate::devices::Category;
use crate::event::{BridgeEvent, EventSender, emit};
use crate::transport::Transport;

/// Everything a discovery generator may reference.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryContext {
    pub device_id: String,
    pub name: String,
    pub category: Category,
    pub state_topic: String,
    pub command_topic: String,
    pub availability_topic: String,
    pub sw_version: String,
    pub configuration_url: Option<String>,
}

impl DiscoveryContext {
    pub fn new(config: &BridgeConfig, name: &str, category: &Category) -> Self {
        Self {
            device_id: config.device_id(),
            name: name.to_string(),
            category: category.clone(),
            state_topic: config.state_topic(),
            command_topic: config.command_topic(),
            availability_topic: config.availability_topic(),
            sw_version: config.sw_version.clone(),
            configuration_url: config.configuration_url.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(device_id: &str, name: &str, category: Category) -> Self {
        let config = BridgeConfig::default();
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            category,
            state_topic: format!("{device_id}/state"),
            command_topic: format!("{device_id}/command"),
            availability_topic: format!("{device_id}/LWT"),
            sw_version: config.sw_version,
            configuration_url: None,
        }
    }
}

/// Produces one discovery descriptor.
pub type DiscoveryGenerator = Box<dyn Fn(&DiscoveryContext) -> Value + Send + Sync>;

/// `homeassistant/{category}/{device_id}/config`
pub fn discovery_topic(category: &str, device_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{category}/{device_id}/config")
}

#[derive(Debug, Serialize)]
struct DeviceBlock<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    sw_version: &'a str,
    model: &'a str,
    manufacturer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    configuration_url: Option<&'a str>,
}

/// The `device` object shared by every descriptor of one device.
pub fn device_block(ctx: &DiscoveryContext) -> Value {
    json!(DeviceBlock {
        identifiers: [&ctx.device_id],
        name: &ctx.name,
        sw_version: &ctx.sw_version,
        model: ctx.category.as_str(),
        manufacturer: MANUFACTURER,
        configuration_url: ctx.configuration_url.as_deref(),
    })
}

#[derive(Debug, Serialize)]
struct Availability<'a> {
    topic: &'a str,
}

#[derive(Debug, Serialize)]
struct DefaultDescriptor<'a> {
    unique_id: String,
    name: &'a str,
    platform: &'a str,
    schema: &'a str,
    state_topic: &'a str,
    command_topic: &'a str,
    payload_on: &'a str,
    payload_off: &'a str,
    availability: Availability<'a>,
    device: Value,
}

/// Baseline descriptor for a device that declares none of its own.
pub fn default_discovery(ctx: &DiscoveryContext) -> Value {
    json!(DefaultDescriptor {
        unique_id: format!("{}_{}", ctx.device_id, ctx.category),
        name: &ctx.name,
        platform: "mqtt",
        schema: "json",
        state_topic: &ctx.state_topic,
        command_topic: &ctx.command_topic,
        payload_on: PAYLOAD_ON,
        payload_off: PAYLOAD_OFF,
        availability: Availability {
            topic: &ctx.availability_topic,
        },
        device: device_block(ctx),
    })
}

/// Discovery generators keyed by category, kept in registration order.
#[derive(Default)]
pub struct DiscoveryRegistry {
    entries: Vec<(String, DiscoveryGenerator)>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `generator` under `category`. A second registration for the
    /// same category replaces the first and keeps its position.
    pub fn register<F>(&mut self, category: impl Into<String>, generator: F)
    where
        F: Fn(&DiscoveryContext) -> Value + Send + Sync + 'static,
    {
        let category = category.into();
        let generator: DiscoveryGenerator = Box::new(generator);
        match self.entries.iter_mut().find(|(key, _)| *key == category) {
            Some(entry) => entry.1 = generator,
            None => self.entries.push((category, generator)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// `(topic, descriptor)` for every entry, in registration order.
    pub fn build_messages(&self, ctx: &DiscoveryContext) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|(category, generator)| (discovery_topic(category, &ctx.device_id), generator(ctx)))
            .collect()
    }

    /// Publish every descriptor. A failed publish is logged and the
    /// remaining entries are still attempted. Returns the number published.
    pub async fn emit_all<T: Transport>(
        &self,
        transport: &mut T,
        ctx: &DiscoveryContext,
        events: &EventSender,
    ) -> usize {
        let mut published = 0;
        for (topic, descriptor) in self.build_messages(ctx) {
            let payload = match serde_json::to_vec(&descriptor) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Discovery descriptor for {topic} not serializable: {e}");
                    continue;
                }
            };
            match transport.publish(&topic, &payload, false).await {
                Ok(()) => {
                    debug!("Discovery published on {topic}");
                    emit(events, BridgeEvent::DiscoveryPublished { topic });
                    published += 1;
                }
                Err(e) => warn!("Discovery publish on {topic} failed: {e}"),
            }
        }
        info!("Published {published}/{} discovery messages", self.len());
        published
    }
}

impl std::fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.categories()).finish()
    }
}
