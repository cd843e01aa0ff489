// MIT License - Copyright (c) 2026 Peter Wright
// Temperature sensor sampled from a value file

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, warn};

use super::{DeviceState, SharedDevice, StatefulDevice, requested_state};
use crate::discovery::{DiscoveryContext, device_block};
use crate::error::{BridgeError, Result};

/// Default source: the first Linux thermal zone, in millidegrees Celsius.
pub const DEFAULT_SENSOR_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

type Reading = Arc<Mutex<Option<f64>>>;

/// Temperature sensor. Adds `"temperature"` to the state payload.
#[derive(Debug, Clone)]
pub struct TemperatureSensor {
    path: PathBuf,
    /// Raw value units per degree (1000 for millidegree files)
    scale: f64,
    reading: Reading,
}

impl TemperatureSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scale: 1000.0,
            reading: Arc::new(Mutex::new(None)),
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Read the source once and store the result.
    pub fn sample(&self) -> Result<f64> {
        let celsius = read_celsius(&self.path, self.scale)?;
        if let Ok(mut reading) = self.reading.lock() {
            *reading = Some(celsius);
        }
        Ok(celsius)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.reading.lock().ok().and_then(|r| *r)
    }

    /// Background task that samples every `period` and marks the device for
    /// publication. The sensor must be the behaviour of `device`.
    pub fn spawn_sampler(&self, device: SharedDevice, period: Duration) -> JoinHandle<()> {
        let sensor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                match sensor.sample() {
                    Ok(celsius) => {
                        debug!("Temperature sample: {celsius:.1} C");
                        device.lock().await.notify_listeners();
                    }
                    Err(e) => warn!("Temperature sample from {} failed: {e}", sensor.path.display()),
                }
            }
        })
    }
}

fn read_celsius(path: &Path, scale: f64) -> Result<f64> {
    let raw = std::fs::read_to_string(path)?;
    let value: f64 = raw.trim().parse().map_err(|_| {
        BridgeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a number: {:?}", raw.trim()),
        ))
    })?;
    Ok((value / scale * 10.0).round() / 10.0)
}

impl StatefulDevice for TemperatureSensor {
    fn apply_state(&mut self, _state: &DeviceState) -> Result<()> {
        Ok(())
    }

    fn command_handler(&mut self, _topic: &str, message: &Value) -> Result<Option<DeviceState>> {
        Ok(requested_state(message))
    }

    fn extend_state(&self, payload: &mut Map<String, Value>) {
        if let Some(celsius) = self.temperature() {
            payload.insert("temperature".to_string(), json!(celsius));
        }
    }

    fn discovery(&self, ctx: &DiscoveryContext) -> Vec<(String, Value)> {
        vec![(
            "sensor".to_string(),
            json!({
                "unique_id": format!("{}_sensor", ctx.device_id),
                "name": ctx.name,
                "platform": "mqtt",
                "state_topic": ctx.state_topic,
                "device_class": "temperature",
                "unit_of_measurement": "°C",
                "value_template": "{{ value_json.temperature }}",
                "availability": { "topic": ctx.availability_topic },
                "device": device_block(ctx),
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Category, Device};

    fn sensor_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rockwren-{name}-{}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_sample_millidegrees() {
        let path = sensor_file("thermal", "45123\n");
        let sensor = TemperatureSensor::new(&path);
        assert_eq!(sensor.temperature(), None);
        assert_eq!(sensor.sample().unwrap(), 45.1);
        assert_eq!(sensor.temperature(), Some(45.1));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_sample_rejects_garbage() {
        let path = sensor_file("thermal-garbage", "hot");
        let sensor = TemperatureSensor::new(&path);
        assert!(sensor.sample().is_err());
        assert_eq!(sensor.temperature(), None);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_state_payload_carries_temperature() {
        let path = sensor_file("thermal-payload", "21.5");
        let sensor = TemperatureSensor::new(&path).scale(1.0);
        let handle = sensor.clone();
        let device = Device::new("Thermometer", Category::Sensor, sensor);

        assert_eq!(device.serialize_state().unwrap(), br#"{"state":"OFF"}"#.to_vec());
        handle.sample().unwrap();
        assert_eq!(
            device.serialize_state().unwrap(),
            br#"{"state":"OFF","temperature":21.5}"#.to_vec()
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_discovery_declares_sensor() {
        let sensor = TemperatureSensor::new(DEFAULT_SENSOR_PATH);
        let ctx = DiscoveryContext::for_test("rockwren_abc", "Thermometer", Category::Sensor);
        let entries = sensor.discovery(&ctx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "sensor");
        assert_eq!(entries[0].1["unique_id"], "rockwren_abc_sensor");
        assert_eq!(entries[0].1["state_topic"], "rockwren_abc/state");
    }
}
