// MIT License - Copyright (c) 2026 Peter Wright
// Device state model and the behaviour contract implemented per device

pub mod door;
pub mod switch;
pub mod temperature;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::constants::{PAYLOAD_OFF, PAYLOAD_ON, VERSION};
use crate::discovery::DiscoveryContext;
use crate::error::{BridgeError, Result};

pub use door::DoorSensor;
pub use switch::OnOffOutput;
pub use temperature::TemperatureSensor;

/// Device state as carried on the wire.
///
/// `On`/`Off` cover every built-in category. `Other` carries any value a
/// command asked for; it is rejected by `set_state` unless the category
/// allows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceState {
    On,
    Off,
    Other(String),
}

impl DeviceState {
    /// Parse a state value, case-insensitively.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            PAYLOAD_ON => Self::On,
            PAYLOAD_OFF => Self::Off,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::On => PAYLOAD_ON,
            Self::Off => PAYLOAD_OFF,
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Home Assistant component a device is exposed as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    Light,
    Switch,
    BinarySensor,
    Sensor,
    Button,
    Other(String),
}

impl Category {
    /// Parse a discovery component name (e.g. "light", "binary_sensor").
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "light" => Self::Light,
            "switch" => Self::Switch,
            "binary_sensor" => Self::BinarySensor,
            "sensor" => Self::Sensor,
            "button" => Self::Button,
            other => Self::Other(other.to_string()),
        }
    }

    /// Discovery component name, used in discovery topics.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::BinarySensor => "binary_sensor",
            Self::Sensor => "sensor",
            Self::Button => "button",
            Self::Other(s) => s,
        }
    }

    /// Whether a device of this category may be set to `state`.
    ///
    /// Built-in categories are on/off. Other components define their own
    /// vocabulary (a cover opens and closes), so any state is accepted.
    pub fn allows(&self, state: &DeviceState) -> bool {
        match self {
            Self::Other(_) => true,
            _ => matches!(state, DeviceState::On | DeviceState::Off),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour contract of a concrete device.
///
/// The [`Device`] holder owns name, category, state and listeners; the
/// behaviour only reacts. It never mutates state itself: a command handler
/// returns the state it wants and the holder routes it through
/// [`Device::set_state`].
pub trait StatefulDevice: Send {
    /// Drive the hardware to `state`. Called once per actual state change.
    fn apply_state(&mut self, state: &DeviceState) -> Result<()>;

    /// Interpret a decoded command received on `topic`.
    ///
    /// Returns the requested state, or `None` when the message asks for
    /// no state change. Most devices delegate to [`requested_state`].
    fn command_handler(&mut self, topic: &str, message: &Value) -> Result<Option<DeviceState>>;

    /// Extra fields merged into the `{"state": ...}` payload.
    fn extend_state(&self, _payload: &mut Map<String, Value>) {}

    /// Discovery descriptors for this device as `(category, descriptor)` pairs.
    ///
    /// An empty list means the default descriptor for the device category
    /// is used.
    fn discovery(&self, _ctx: &DiscoveryContext) -> Vec<(String, Value)> {
        Vec::new()
    }
}

/// Base command handling shared by on/off devices: reads the `state` field.
pub fn requested_state(message: &Value) -> Option<DeviceState> {
    message
        .get("state")
        .and_then(Value::as_str)
        .map(DeviceState::parse)
}

/// State-change listener. Errors and panics are isolated per listener.
pub type Listener = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Device shared between the bridge and hardware tasks.
pub type SharedDevice = Arc<Mutex<Device>>;

#[derive(Serialize)]
struct StatePayload<'a> {
    state: &'a str,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// State holder for one physical or logical device.
pub struct Device {
    name: String,
    category: Category,
    state: DeviceState,
    behavior: Box<dyn StatefulDevice>,
    listeners: Vec<Listener>,
}

impl Device {
    /// Create a device in the `OFF` state and drive the hardware to match.
    pub fn new(
        name: impl Into<String>,
        category: Category,
        behavior: impl StatefulDevice + 'static,
    ) -> Self {
        let mut behavior: Box<dyn StatefulDevice> = Box::new(behavior);
        let state = DeviceState::Off;
        let name = name.into();
        if let Err(e) = behavior.apply_state(&state) {
            warn!("{name}: failed to apply initial state: {e}");
        }
        Self {
            name,
            category,
            state,
            behavior,
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn is_on(&self) -> bool {
        self.state == DeviceState::On
    }

    /// The single state-transition entry point.
    ///
    /// Returns `Ok(true)` when the state changed, `Ok(false)` when the
    /// device already was in `new_state` (nothing is applied or notified).
    pub fn set_state(&mut self, new_state: DeviceState) -> Result<bool> {
        if !self.category.allows(&new_state) {
            return Err(BridgeError::InvalidState {
                state: new_state.to_string(),
                category: self.category.to_string(),
            });
        }
        if new_state == self.state {
            return Ok(false);
        }

        debug!("{}: {} -> {}", self.name, self.state, new_state);
        self.state = new_state;
        if let Err(e) = self.behavior.apply_state(&self.state) {
            warn!("{}: failed to apply state {}: {e}", self.name, self.state);
        }
        self.notify_listeners();
        Ok(true)
    }

    pub fn on(&mut self) -> Result<bool> {
        self.set_state(DeviceState::On)
    }

    pub fn off(&mut self) -> Result<bool> {
        self.set_state(DeviceState::Off)
    }

    pub fn toggle(&mut self) -> Result<bool> {
        if self.is_on() { self.off() } else { self.on() }
    }

    /// Append a listener. There is no de-duplication and no removal.
    pub fn register_listener<F>(&mut self, listener: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Run every listener in registration order.
    ///
    /// Also used by devices whose measurements changed without a state
    /// transition.
    pub fn notify_listeners(&self) {
        for (index, listener) in self.listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: listener {index} failed: {e}", self.name),
                Err(_) => error!("{}: listener {index} panicked", self.name),
            }
        }
    }

    /// Hand a decoded command to the behaviour and apply the state it asks for.
    pub fn handle_command(&mut self, topic: &str, message: &Value) -> Result<()> {
        if let Some(state) = self.behavior.command_handler(topic, message)? {
            self.set_state(state)?;
        }
        Ok(())
    }

    /// Wire payload for the current state: `{"state": ...}` plus device extras.
    pub fn serialize_state(&self) -> Result<Vec<u8>> {
        let mut extra = Map::new();
        self.behavior.extend_state(&mut extra);
        extra.remove("state");
        let payload = StatePayload {
            state: self.state.as_str(),
            extra,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Discovery descriptors declared by the behaviour.
    pub fn discovery(&self, ctx: &DiscoveryContext) -> Vec<(String, Value)> {
        self.behavior.discovery(ctx)
    }

    /// JSON summary of the device.
    pub fn information(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "type": self.category.as_str(),
            "state": self.state.as_str(),
            "version": VERSION,
        })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(state={})", self.name, self.state)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
