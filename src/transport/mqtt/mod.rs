//! rumqttc implementation of the broker boundary
//!
//! - [`connection`] - pure option building and reconnect timing
//! - [`message_handler`] - pure event routing
//! - [`client`] - the session and its network thread

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttBackend, RumqttSession};
pub use connection::{configure_mqtt_options, ReconnectConfig};
pub use message_handler::{route_mqtt_event, EventRoute};
