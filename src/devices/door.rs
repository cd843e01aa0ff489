// MIT License - Copyright (c) 2026 Peter Wright
// Door position binary sensor

use std::path::PathBuf;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval};
use tracing::{info, warn};

use super::{DeviceState, SharedDevice, StatefulDevice, requested_state};
use crate::discovery::{DiscoveryContext, device_block};
use crate::error::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Minimum time between two accepted "closed" readings.
pub const CLOSE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Door contact read from a GPIO value file. ON means open.
#[derive(Debug, Clone)]
pub struct DoorSensor {
    input_path: PathBuf,
    poll_interval: Duration,
}

impl DoorSensor {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn read_open(&self) -> Result<bool> {
        let raw = std::fs::read_to_string(&self.input_path)?;
        Ok(raw.trim() != "0")
    }

    /// Watch the input and drive the device state on every accepted level
    /// change.
    pub fn spawn_watcher(&self, device: SharedDevice) -> JoinHandle<()> {
        let sensor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(sensor.poll_interval);
            let mut debouncer = Debouncer::new(CLOSE_DEBOUNCE);
            let mut last_level = None;
            loop {
                ticker.tick().await;
                let open = match sensor.read_open() {
                    Ok(open) => open,
                    Err(e) => {
                        warn!("Door input {} unreadable: {e}", sensor.input_path.display());
                        continue;
                    }
                };
                if last_level == Some(open) {
                    continue;
                }
                // A suppressed close is observed again on the next tick
                let Some(state) = debouncer.observe(open, Instant::now()) else {
                    continue;
                };
                last_level = Some(open);

                info!("Door {}", if open { "open" } else { "closed" });
                if let Err(e) = device.lock().await.set_state(state) {
                    warn!("Door state update failed: {e}");
                }
            }
        })
    }
}

/// Open is reported immediately; closed only once per debounce window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_close: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_close: None,
        }
    }

    pub fn observe(&mut self, open: bool, now: Instant) -> Option<DeviceState> {
        if open {
            return Some(DeviceState::On);
        }
        match self.last_close {
            Some(at) if now.duration_since(at) <= self.window => None,
            _ => {
                self.last_close = Some(now);
                Some(DeviceState::Off)
            }
        }
    }
}

impl StatefulDevice for DoorSensor {
    fn apply_state(&mut self, _state: &DeviceState) -> Result<()> {
        Ok(())
    }

    fn command_handler(&mut self, _topic: &str, message: &Value) -> Result<Option<DeviceState>> {
        Ok(requested_state(message))
    }

    fn discovery(&self, ctx: &DiscoveryContext) -> Vec<(String, Value)> {
        vec![
            (
                "binary_sensor".to_string(),
                json!({
                    "unique_id": format!("{}_door", ctx.device_id),
                    "name": ctx.name,
                    "platform": "mqtt",
                    "device_class": "door",
                    "state_topic": ctx.state_topic,
                    "value_template": "{{ value_json.state }}",
                    "availability": { "topic": ctx.availability_topic },
                    "device": device_block(ctx),
                }),
            ),
            (
                "sensor".to_string(),
                json!({
                    "unique_id": format!("{}_door_position", ctx.device_id),
                    "name": format!("{} position", ctx.name),
                    "platform": "mqtt",
                    "state_topic": ctx.state_topic,
                    "value_template": "{{ 'open' if value_json.state == 'ON' else 'closed' }}",
                    "availability": { "topic": ctx.availability_topic },
                    "device": device_block(ctx),
                }),
            ),
        ]
    }
}
