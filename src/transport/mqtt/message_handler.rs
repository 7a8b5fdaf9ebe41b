//! Pure routing of rumqttc network events into session callbacks

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::{ConnectionError, Event};

/// What the network loop should do with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Broker answered CONNECT with a failure code
    ConnectionRejected(String),
    /// Broker sent DISCONNECT
    DisconnectedByBroker(String),
    /// Anything else (acks, pings, outgoing publishes)
    Infrastructure,
}

/// Route one event from the connection iterator
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => {
            if connack.code == ConnectReturnCode::Success {
                EventRoute::ConnectionAcknowledged
            } else {
                EventRoute::ConnectionRejected(format!("{:?}", connack.code))
            }
        }
        Event::Incoming(Packet::Disconnect(disconnect)) => {
            EventRoute::DisconnectedByBroker(format!("{:?}", disconnect.reason_code))
        }
        _ => EventRoute::Infrastructure,
    }
}

/// Human-readable reason for a network loop error
pub fn describe_connection_error(error: &ConnectionError) -> String {
    match error {
        ConnectionError::ConnectionRefused(code) => format!("connection refused: {code:?}"),
        other => other.to_string(),
    }
}
