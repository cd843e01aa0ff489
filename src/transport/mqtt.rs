// MIT License - Copyright (c) 2026 Peter Wright
// MQTT transport over rumqttc

use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport as ChannelKind,
};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::{InboundMessage, LastWill, Transport};
use crate::config::BridgeConfig;
use crate::constants::{CLIENT_REQUEST_CAPACITY, MIN_KEEPALIVE_SECS};
use crate::error::{BridgeError, Result};

/// Broker connection built on the rumqttc client and event loop.
///
/// rumqttc only moves packets while its event loop is polled, so the
/// transport polls it from `check_msg` (dispatch loop) and `reconnect`
/// (supervisor). Messages seen while waiting for an acknowledgement are kept
/// for the next `check_msg`.
pub struct MqttTransport {
    options: MqttOptions,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    subscriptions: Vec<String>,
    pending: VecDeque<InboundMessage>,
    conn_issue: bool,
    poll_timeout: Duration,
    connect_timeout: Duration,
}

impl MqttTransport {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let mut options =
            MqttOptions::new(config.device_id(), &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(
            config.keepalive_secs.max(MIN_KEEPALIVE_SECS),
        ));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        if config.secure_channel() {
            options.set_transport(tls_channel(config)?);
        }

        Ok(Self {
            options,
            client: None,
            eventloop: None,
            subscriptions: Vec::new(),
            pending: VecDeque::new(),
            conn_issue: false,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }

    fn client(&self) -> Result<&AsyncClient> {
        if self.conn_issue {
            return Err(BridgeError::NotConnected);
        }
        self.client.as_ref().ok_or(BridgeError::NotConnected)
    }

    /// Poll the event loop until the broker acknowledges the connection.
    async fn await_connack(&mut self) -> Result<()> {
        let eventloop = self.eventloop.as_mut().ok_or(BridgeError::NotConnected)?;
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, eventloop.poll()).await {
                Err(_) => return Err(BridgeError::ConnectTimeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    debug!("MQTT: ConnAck {:?}", ack.code);
                    return Ok(());
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.pending.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Ok(_)) => {}
            }
        }
    }
}

/// TLS with client authentication, verified against the configured CA.
fn tls_channel(config: &BridgeConfig) -> Result<ChannelKind> {
    let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) else {
        return Ok(ChannelKind::tcp());
    };
    let ca = config.ca_cert.clone().ok_or_else(|| BridgeError::Config {
        reason: "a CA certificate is required when a client certificate and key are configured"
            .to_string(),
    })?;
    Ok(ChannelKind::tls(ca, Some((cert.clone(), key.clone())), None))
}

impl Transport for MqttTransport {
    async fn connect(&mut self, will: &LastWill) -> Result<()> {
        let mut options = self.options.clone();
        options.set_last_will(rumqttc::LastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
        ));
        let (host, port) = options.broker_address();
        info!("MQTT: connecting to {host}:{port}");

        let (client, eventloop) = AsyncClient::new(options, CLIENT_REQUEST_CAPACITY);
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        self.pending.clear();

        match self.await_connack().await {
            Ok(()) => {
                self.conn_issue = false;
                info!("MQTT: connected to {host}:{port}");
                Ok(())
            }
            Err(e) => {
                self.conn_issue = true;
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        // The event loop reconnects on the next poll after an error
        self.await_connack().await?;
        self.conn_issue = false;
        Ok(())
    }

    fn is_conn_issue(&self) -> bool {
        self.conn_issue
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())?;
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.client()?.try_subscribe(filter, QoS::AtLeastOnce)?;
        if !self.subscriptions.iter().any(|s| s == filter) {
            self.subscriptions.push(filter.to_string());
        }
        debug!("MQTT: subscribed to {filter}");
        Ok(())
    }

    async fn resubscribe(&mut self) -> Result<()> {
        let client = self.client()?;
        for filter in &self.subscriptions {
            client.try_subscribe(filter, QoS::AtLeastOnce)?;
        }
        debug!("MQTT: renewed {} subscriptions", self.subscriptions.len());
        Ok(())
    }

    async fn check_msg(&mut self) -> Result<Option<InboundMessage>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        // Polling now would let the event loop reconnect behind the
        // supervisor's back
        if self.conn_issue {
            return Ok(None);
        }
        let Some(eventloop) = self.eventloop.as_mut() else {
            return Ok(None);
        };

        match timeout(self.poll_timeout, eventloop.poll()).await {
            Err(_) => Ok(None),
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => Ok(Some(InboundMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => {
                warn!("MQTT event loop error: {e}");
                self.conn_issue = true;
                Err(e.into())
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let (Some(client), Some(eventloop)) = (self.client.take(), self.eventloop.as_mut()) else {
            return Ok(());
        };
        client.try_disconnect()?;

        // Flush queued publications and the disconnect packet
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("MQTT: event loop closed during disconnect: {e}");
                    break;
                }
                Err(_) => return Err(BridgeError::ConnectTimeout),
            }
        }
        self.eventloop = None;
        info!("MQTT: disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config = BridgeConfig::builder()
            .unique_id("e6614c311b")
            .broker_host("broker.local")
            .broker_port(8883)
            .keepalive_secs(1)
            .build();
        let transport = MqttTransport::new(&config).unwrap();
        assert_eq!(transport.options.client_id(), "rockwren_e6614c311b");
        assert_eq!(
            transport.options.broker_address(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(transport.options.keep_alive(), Duration::from_secs(MIN_KEEPALIVE_SECS));
        assert!(!transport.is_conn_issue());
    }

    #[test]
    fn test_tls_requires_ca() {
        let config = BridgeConfig::builder()
            .unique_id("e6614c311b")
            .client_auth("cert", "key")
            .build();
        assert!(matches!(
            MqttTransport::new(&config),
            Err(BridgeError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_requests_before_connect_fail() {
        let config = BridgeConfig::builder().unique_id("e6614c311b").build();
        let mut transport = MqttTransport::new(&config).unwrap();
        assert!(matches!(
            transport.publish("t", b"x", false).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(transport.check_msg().await.unwrap().is_none());
        assert!(transport.disconnect().await.is_ok());
    }
}
