// MIT License - Copyright (c) 2026 Peter Wright
// Device to MQTT bridge

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use rockwren_bridge::constants::{
    DEFAULT_CLIENT_ID, DEFAULT_KEEPALIVE_SECS, DEFAULT_MQTT_PORT, DEFAULT_PUBLISH_INTERVAL_SECS,
    DEFAULT_QUEUE_CAPACITY,
};
use rockwren_bridge::devices::temperature::{DEFAULT_SAMPLE_INTERVAL, DEFAULT_SENSOR_PATH};
use rockwren_bridge::{
    Bridge, BridgeConfig, Category, Device, DoorSensor, MemoryTransport, MqttTransport,
    OnOffOutput, TemperatureSensor, Transport,
};

const DEFAULT_MQTTS_PORT: u16 = 8883;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "rockwren2mqtt")]
#[command(about = "Bridge between a light, switch or sensor and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Log MQTT traffic instead of connecting to the broker
    #[arg(long)]
    dry_run: bool,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    mqtt: MqttToml,
    device: DeviceToml,
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    /// Hardware-unique id, e.g. the board serial or MAC address
    unique_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_keepalive")]
    keepalive_secs: u64,
    #[serde(default = "default_publish_interval")]
    publish_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
    /// PEM files; cert and key together enable TLS
    #[serde(default)]
    client_cert: Option<PathBuf>,
    #[serde(default)]
    client_key: Option<PathBuf>,
    #[serde(default)]
    ca_cert: Option<PathBuf>,
    #[serde(default)]
    configuration_url: Option<String>,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}
fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}
fn default_publish_interval() -> u64 {
    DEFAULT_PUBLISH_INTERVAL_SECS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DeviceKind {
    Light,
    Switch,
    Temperature,
    Door,
}

#[derive(Debug, Deserialize)]
struct DeviceToml {
    name: String,
    kind: DeviceKind,
    /// Light/switch output value file (e.g. /sys/class/leds/led0/brightness)
    #[serde(default)]
    output_path: Option<PathBuf>,
    /// Write 0 for ON (active-low outputs)
    #[serde(default)]
    inverted: bool,
    /// Temperature source in millidegrees
    #[serde(default = "default_sensor_path")]
    sensor_path: PathBuf,
    #[serde(default = "default_sample_interval")]
    sample_interval_secs: u64,
    /// Door contact value file (e.g. /sys/class/gpio/gpio22/value)
    #[serde(default)]
    input_path: Option<PathBuf>,
}

fn default_sensor_path() -> PathBuf {
    PathBuf::from(DEFAULT_SENSOR_PATH)
}
fn default_sample_interval() -> u64 {
    DEFAULT_SAMPLE_INTERVAL.as_secs()
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port, tls).
fn parse_mqtt_url(url: &str) -> Result<(String, u16, bool)> {
    let (stripped, tls) = match url.strip_prefix("mqtts://") {
        Some(rest) => (rest, true),
        None => (
            url.strip_prefix("mqtt://")
                .or_else(|| url.strip_prefix("tcp://"))
                .unwrap_or(url),
            false,
        ),
    };
    let stripped = stripped.trim_end_matches('/');

    let (host, port) = match stripped.rsplit_once(':') {
        Some((host, port_str)) => (host, port_str.parse().context("Invalid MQTT port number")?),
        None if tls => (stripped, DEFAULT_MQTTS_PORT),
        None => (stripped, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        bail!("MQTT URL must be in format mqtt://host:port");
    }
    Ok((host.to_string(), port, tls))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn build_bridge_config(mqtt: &MqttToml) -> Result<BridgeConfig> {
    let (host, port, tls) = parse_mqtt_url(&mqtt.url)?;

    let mut builder = BridgeConfig::builder()
        .client_id(&mqtt.client_id)
        .unique_id(&mqtt.unique_id)
        .broker_host(host)
        .broker_port(port)
        .keepalive_secs(mqtt.keepalive_secs)
        .publish_interval_secs(mqtt.publish_interval_secs)
        .queue_capacity(mqtt.queue_capacity);

    if let (Some(username), Some(password)) = (&mqtt.username, &mqtt.password) {
        builder = builder.credentials(username, password);
    }
    match (&mqtt.client_cert, &mqtt.client_key) {
        (Some(cert), Some(key)) => {
            builder = builder.client_auth(read_pem(cert)?, read_pem(key)?);
        }
        (None, None) if tls => bail!("mqtts:// requires client_cert and client_key"),
        (None, None) => {}
        _ => bail!("client_cert and client_key must be provided together"),
    }
    if let Some(ca) = &mqtt.ca_cert {
        builder = builder.ca_cert(read_pem(ca)?);
    }
    if let Some(url) = &mqtt.configuration_url {
        builder = builder.configuration_url(url);
    }

    let config = builder.build();
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Background work a device needs besides the bridge.
enum DeviceTask {
    None,
    Sampler(TemperatureSensor, Duration),
    Watcher(DoorSensor),
}

fn build_device(toml: &DeviceToml) -> Result<(Device, DeviceTask)> {
    let built = match toml.kind {
        DeviceKind::Light | DeviceKind::Switch => {
            let category = if toml.kind == DeviceKind::Light {
                Category::Light
            } else {
                Category::Switch
            };
            let output = OnOffOutput::new(toml.output_path.clone()).inverted(toml.inverted);
            (Device::new(&toml.name, category, output), DeviceTask::None)
        }
        DeviceKind::Temperature => {
            let sensor = TemperatureSensor::new(&toml.sensor_path);
            let period = Duration::from_secs(toml.sample_interval_secs.max(1));
            (
                Device::new(&toml.name, Category::Sensor, sensor.clone()),
                DeviceTask::Sampler(sensor, period),
            )
        }
        DeviceKind::Door => {
            let path = toml
                .input_path
                .as_ref()
                .context("device.input_path is required for a door sensor")?;
            let sensor = DoorSensor::new(path);
            (
                Device::new(&toml.name, Category::BinarySensor, sensor.clone()),
                DeviceTask::Watcher(sensor),
            )
        }
    };
    Ok(built)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// Run one bridge until a signal arrives. Returns true for a restart.
async fn serve<T: Transport>(
    bridge: Bridge<T>,
    task: DeviceTask,
    sighup: &mut Signal,
    sigterm: &mut Signal,
) -> bool {
    let handles: Vec<JoinHandle<()>> = match task {
        DeviceTask::None => Vec::new(),
        DeviceTask::Sampler(sensor, period) => vec![sensor.spawn_sampler(bridge.device(), period)],
        DeviceTask::Watcher(sensor) => vec![sensor.spawn_watcher(bridge.device())],
    };
    info!("Device: {}", bridge.information().await);

    info!("Bridge starting. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
    let restart = tokio::select! {
        _ = bridge.run() => false,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            false
        }
        _ = sighup.recv() => {
            info!("Received SIGHUP, reloading config and restarting...");
            true
        }
    };

    for handle in handles {
        handle.abort();
    }
    if let Err(e) = bridge.shutdown().await {
        warn!("Error during shutdown: {e}");
    }
    restart
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=rockwren_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    let mut bridge_config = build_bridge_config(&config.mqtt)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let (device, task) = build_device(&config.device)?;
        let restart = if cli.dry_run {
            info!("Dry run: MQTT traffic is logged, not sent");
            let bridge = Bridge::new(bridge_config.clone(), device, MemoryTransport::logging())?;
            serve(bridge, task, &mut sighup, &mut sigterm).await
        } else {
            let transport = MqttTransport::new(&bridge_config)?;
            let bridge = Bridge::new(bridge_config.clone(), device, transport)?;
            serve(bridge, task, &mut sighup, &mut sigterm).await
        };

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config).and_then(|new_config| {
            let new_bridge_config = build_bridge_config(&new_config.mqtt)?;
            build_device(&new_config.device)?;
            Ok((new_config, new_bridge_config))
        }) {
            Ok((new_config, new_bridge_config)) => {
                config = new_config;
                bridge_config = new_bridge_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mqtt_url() {
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884, false)
        );
        assert_eq!(
            parse_mqtt_url("tcp://10.0.0.2:1883").unwrap(),
            ("10.0.0.2".to_string(), 1883, false)
        );
        assert_eq!(
            parse_mqtt_url("mqtts://broker.local").unwrap(),
            ("broker.local".to_string(), 8883, true)
        );
        assert_eq!(
            parse_mqtt_url("broker.local").unwrap(),
            ("broker.local".to_string(), 1883, false)
        );
        assert!(parse_mqtt_url("mqtt://broker.local:port").is_err());
        assert!(parse_mqtt_url("mqtt://:1883").is_err());
    }

    #[test]
    fn test_config_file() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            url = "mqtt://192.168.1.5:1883"
            unique_id = "e6614c311b"
            configuration_url = "http://192.168.1.20/"

            [device]
            name = "Desk lamp"
            kind = "light"
            inverted = true
            "#,
        )
        .unwrap();
        let bridge_config = build_bridge_config(&config.mqtt).unwrap();
        assert_eq!(bridge_config.device_id(), "rockwren_e6614c311b");
        assert_eq!(bridge_config.broker_port, 1883);
        assert_eq!(bridge_config.publish_interval_secs, 10);
        assert!(!bridge_config.secure_channel());

        let (device, task) = build_device(&config.device).unwrap();
        assert_eq!(device.category(), &Category::Light);
        assert!(matches!(task, DeviceTask::None));
    }

    #[test]
    fn test_door_requires_input_path() {
        let toml: DeviceToml = toml::from_str(
            r#"
            name = "Back door"
            kind = "door"
            "#,
        )
        .unwrap();
        assert!(build_device(&toml).is_err());
    }

    #[test]
    fn test_mqtts_without_client_auth_rejected() {
        let mqtt: MqttToml = toml::from_str(
            r#"
            url = "mqtts://broker.local"
            unique_id = "e6614c311b"
            "#,
        )
        .unwrap();
        assert!(build_bridge_config(&mqtt).is_err());
    }
}
