// MIT License - Copyright (c) 2026 Peter Wright
// On/off output: lights and switches

use std::path::PathBuf;

use serde_json::Value;
use tracing::info;

use super::{DeviceState, StatefulDevice, requested_state};
use crate::error::Result;

/// Light or switch that drives a single on/off output.
///
/// The output is a value file such as `/sys/class/leds/led0/brightness` or
/// a sysfs GPIO `value`. Without a path the device only logs transitions.
#[derive(Debug, Clone, Default)]
pub struct OnOffOutput {
    output_path: Option<PathBuf>,
    /// Write `0` for ON and `1` for OFF (active-low LEDs).
    inverted: bool,
}

impl OnOffOutput {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self {
            output_path,
            inverted: false,
        }
    }

    pub fn inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    fn level(&self, state: &DeviceState) -> &'static str {
        match (state == &DeviceState::On) ^ self.inverted {
            true => "1",
            false => "0",
        }
    }
}

impl StatefulDevice for OnOffOutput {
    fn apply_state(&mut self, state: &DeviceState) -> Result<()> {
        match &self.output_path {
            Some(path) => std::fs::write(path, self.level(state))?,
            None => info!("Output -> {state}"),
        }
        Ok(())
    }

    fn command_handler(&mut self, _topic: &str, message: &Value) -> Result<Option<DeviceState>> {
        Ok(requested_state(message))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::devices::{Category, Device};

    fn temp_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rockwren-{name}-{}", std::process::id()));
        std::fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn test_output_file_follows_state() {
        let path = temp_file("switch");
        let mut device = Device::new("Lamp", Category::Light, OnOffOutput::new(Some(path.clone())));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");

        device.handle_command("x/command", &json!({"state": "ON"})).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_inverted_output() {
        let path = temp_file("inverted");
        let mut device = Device::new(
            "Onboard LED",
            Category::Light,
            OnOffOutput::new(Some(path.clone())).inverted(true),
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        device.on().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_output_file_does_not_block_state() {
        let path = std::env::temp_dir().join("rockwren-missing-dir").join("value");
        let mut device = Device::new("Relay", Category::Switch, OnOffOutput::new(Some(path)));
        assert!(device.on().unwrap());
        assert!(device.is_on());
    }
}
