//! Broker library boundary
//!
//! The integration talks to the MQTT library only through these traits so the
//! lifecycle logic can be exercised against a scripted in-memory broker. The
//! production implementation lives in [`mqtt`] and is backed by `rumqttc`.

use crate::config::NvrConfig;
use crate::error::MqttResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Map a configured QoS level onto the library type
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Message the broker publishes on our behalf when the session drops uncleanly
#[derive(Debug, Clone, PartialEq)]
pub struct LastWillSpec {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything needed to create a broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub tls: bool,
    pub last_will: Option<LastWillSpec>,
}

impl SessionOptions {
    pub fn from_config(config: &NvrConfig, last_will: Option<LastWillSpec>) -> Self {
        let credentials = config
            .mqtt
            .username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|username| {
                (
                    username.clone(),
                    config.get_mqtt_password().unwrap_or_default(),
                )
            });

        Self {
            client_id: config.client_id(),
            host: config.mqtt.broker_host.clone(),
            port: config.mqtt.broker_port,
            keep_alive: Duration::from_secs(config.mqtt.keepalive_secs),
            credentials,
            tls: config.mqtt.tls_enabled,
            last_will,
        }
    }
}

/// Result of a connection attempt as reported by the network loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted,
    Failed(String),
}

/// Why an established session went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Unexpected(String),
}

/// Callbacks invoked from the session's network thread
pub trait SessionEvents: Send + Sync {
    fn on_connect(&self, outcome: ConnectOutcome);
    fn on_disconnect(&self, reason: DisconnectReason);
    fn on_log(&self, level: Level, message: &str);
}

/// One client session with a broker
///
/// `publish` must only enqueue the message; network I/O happens on the
/// session's own network thread started by `loop_start`.
pub trait BrokerSession: Send + Sync {
    /// Begin connecting; the outcome arrives through `events`
    fn connect(&self, events: Arc<dyn SessionEvents>) -> MqttResult<()>;
    /// Start the background network thread
    fn loop_start(&self) -> MqttResult<()>;
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> MqttResult<()>;
    fn disconnect(&self) -> MqttResult<()>;
    /// Stop and join the network thread
    fn loop_stop(&self) -> MqttResult<()>;
    /// Release every resource held by the session
    fn destroy(&self);
}

/// Factory for broker sessions plus process-wide library teardown
pub trait BrokerBackend: Send + Sync {
    fn create_session(&self, options: SessionOptions) -> MqttResult<Arc<dyn BrokerSession>>;
    fn cleanup(&self);
}
