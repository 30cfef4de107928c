use std::collections::HashSet;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Local;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

use crate::config::MqttConfig;
use crate::heartbeat::Heartbeat;
use crate::models::MeterReading;

/// Requests rumqttc buffers while the broker is unreachable.
const REQUEST_QUEUE: usize = 10;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Unable to serialize reading: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
    #[error("No PUBACK within {0:?}")]
    AckTimeout(Duration),
    #[error("MQTT event loop is gone")]
    Disconnected,
}

/// Telemetry sink accepting one payload at a time.
#[async_trait]
pub trait Telemetry: Send {
    /// Returns once the broker acknowledged the message.
    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), PublishError>;

    async fn disconnect(&mut self) {}
}

/// What the event loop reports about QoS 1 publishes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delivery {
    /// A PUBLISH went out with this packet id (first send or resend).
    Sent(u16),
    Acked(u16),
}

/// Pairs a PUBACK with the publish that is waiting for it.
///
/// rumqttc only hands out the packet id once the event loop writes the
/// PUBLISH, and resends older unacknowledged messages with their old ids
/// after a reconnect, so those ids are remembered and skipped.
#[derive(Debug, Default)]
pub struct AckTracker {
    unacked: HashSet<u16>,
    waiting: bool,
    current: Option<u16>,
}

impl AckTracker {
    pub fn start(&mut self) {
        self.waiting = true;
        self.current = None;
    }

    /// Returns true when `delivery` completes the publish being waited for.
    pub fn on_delivery(&mut self, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Sent(pkid) => {
                if self.waiting && self.current.is_none() && !self.unacked.contains(&pkid) {
                    self.current = Some(pkid);
                }
                return false;
            },
            Delivery::Acked(pkid) => {
                self.unacked.remove(&pkid);
                if self.waiting && self.current == Some(pkid) {
                    self.waiting = false;
                    self.current = None;
                    return true;
                }
                return false;
            },
        }
    }

    /// The publish stopped waiting, a later PUBACK for it must not count
    /// for the next one.
    pub fn give_up(&mut self) {
        if let Some(pkid) = self.current.take() {
            self.unacked.insert(pkid);
        }
        self.waiting = false;
    }
}

/// rumqttc client publishing with QoS 1.
///
/// The event loop runs in its own task and reports sent packets and PUBACKs
/// back, so a publish only counts as done once the broker has that message.
pub struct MqttTelemetry {
    client: AsyncClient,
    deliveries: UnboundedReceiver<Delivery>,
    tracker: AckTracker,
    ack_timeout: Duration,
}

impl MqttTelemetry {
    pub fn connect(config: &MqttConfig) -> Self {
        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(user) = &config.user {
            mqttoptions.set_credentials(user.clone(), config.pass.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_QUEUE);
        let (ack_tx, deliveries) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        if ack_tx.send(Delivery::Sent(pkid)).is_err() {
                            break;
                        }
                    },
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        debug!("PUBACK for packet {}", ack.pkid);
                        if ack_tx.send(Delivery::Acked(ack.pkid)).is_err() {
                            break;
                        }
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    },
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker closed the MQTT connection");
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        if ack_tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
            info!("MQTT Eventloop stopped");
        });

        return MqttTelemetry {
            client,
            deliveries,
            tracker: AckTracker::default(),
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
        };
    }
}

#[async_trait]
impl Telemetry for MqttTelemetry {
    async fn publish(&mut self, topic: &str, payload: String) -> Result<(), PublishError> {
        /* reports about earlier publishes that already gave up */
        while let Ok(delivery) = self.deliveries.try_recv() {
            self.tracker.on_delivery(delivery);
        }

        /* never wait for queue space, during an outage the event loop stops draining it */
        self.client.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        self.tracker.start();

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.deliveries.recv()).await {
                Ok(Some(delivery)) => {
                    if self.tracker.on_delivery(delivery) {
                        return Ok(());
                    }
                },
                Ok(None) => {
                    self.tracker.give_up();
                    return Err(PublishError::Disconnected);
                },
                Err(_) => {
                    self.tracker.give_up();
                    return Err(PublishError::AckTimeout(self.ack_timeout));
                },
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }
    }
}

/// Sends readings to the telemetry topic and keeps the heartbeat fresh.
pub struct Publisher<T: Telemetry> {
    telemetry: T,
    topic: String,
    heartbeat: Heartbeat,
}

impl<T: Telemetry> Publisher<T> {
    pub fn new(telemetry: T, topic: String, heartbeat: Heartbeat) -> Self {
        return Publisher { telemetry, topic, heartbeat };
    }

    pub fn telemetry(&self) -> &T {
        return &self.telemetry;
    }

    /// Publishes one reading. The heartbeat is only written after the broker
    /// acknowledged it, a failed publish leaves the heartbeat to go stale.
    pub async fn publish(&mut self, reading: MeterReading) -> Result<(), PublishError> {
        let payload = reading.to_json()?;
        debug!("{}", serde_json::to_string_pretty(&reading)?);

        if let Err(e) = self.telemetry.publish(&self.topic, payload).await {
            error!("MQTT publish error for meter {}: {}", reading.meter_id, e);
            return Err(e);
        }
        info!("Meter {} data published to topic: {}", reading.meter_id, self.topic);

        if let Err(e) = self.heartbeat.beat(Local::now()).await {
            error!("Unable to write heartbeat {}: {}", self.heartbeat.path().display(), e);
        }

        return Ok(());
    }

    pub async fn shutdown(&mut self) {
        self.telemetry.disconnect().await;
    }
}
