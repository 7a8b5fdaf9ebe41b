//! Home Assistant MQTT discovery documents
//!
//! Each enabled stream gets three retained config documents: a camera fed by
//! the snapshot topic, a motion binary sensor and a detection count sensor.
//! All of them share the device block and the availability topic backed by
//! the connection's last will.

use super::connection::{ConnectionManager, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE};
use super::motion::{MOTION_OFF, MOTION_ON};
use crate::collaborators::StreamInfo;
use crate::config::NvrConfig;
use crate::observability::metrics::metrics;
use crate::topics::{Component, TopicBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

const MANUFACTURER: &str = "LightNVR";
const MODEL: &str = "Network Video Recorder";

/// Groups every entity under one device in Home Assistant
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,
}

impl DeviceDescriptor {
    pub fn from_config(config: &NvrConfig) -> Self {
        let node_id = &config.home_assistant.node_id;
        Self {
            identifiers: vec![node_id.clone()],
            name: node_id.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
            configuration_url: config.home_assistant.configuration_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Availability {
    pub topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
}

impl Availability {
    pub fn new(topic: String) -> Self {
        Self {
            topic,
            payload_available: AVAILABILITY_ONLINE,
            payload_not_available: AVAILABILITY_OFFLINE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub topic: String,
    pub availability: Vec<Availability>,
    pub device: DeviceDescriptor,
}

#[derive(Debug, Clone, Serialize)]
pub struct BinarySensorConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub device_class: &'static str,
    pub availability: Vec<Availability>,
    pub device: DeviceDescriptor,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub state_class: &'static str,
    pub icon: &'static str,
    pub availability: Vec<Availability>,
    pub device: DeviceDescriptor,
}

/// One serialized discovery document ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub component: Component,
    pub topic: String,
    pub payload: String,
}

fn unique_id(topics: &TopicBuilder, component: Component, stream: &str) -> String {
    format!(
        "{}_{}",
        topics.node_id(),
        TopicBuilder::object_id(component, stream)
    )
}

/// Build and serialize the three documents for one stream
///
/// Serialization failures are logged and the affected document skipped.
pub fn build_stream_documents(
    topics: &TopicBuilder,
    device: &DeviceDescriptor,
    stream: &str,
) -> Vec<DiscoveryDocument> {
    let availability = vec![Availability::new(topics.availability())];

    let camera = CameraConfig {
        name: stream.to_string(),
        unique_id: unique_id(topics, Component::Camera, stream),
        object_id: TopicBuilder::object_id(Component::Camera, stream),
        topic: topics.snapshot(stream),
        availability: availability.clone(),
        device: device.clone(),
    };
    let motion = BinarySensorConfig {
        name: format!("{stream} Motion"),
        unique_id: unique_id(topics, Component::BinarySensor, stream),
        object_id: TopicBuilder::object_id(Component::BinarySensor, stream),
        state_topic: topics.motion(stream),
        payload_on: MOTION_ON,
        payload_off: MOTION_OFF,
        device_class: "motion",
        availability: availability.clone(),
        device: device.clone(),
    };
    let count = SensorConfig {
        name: format!("{stream} Detection Count"),
        unique_id: unique_id(topics, Component::Sensor, stream),
        object_id: TopicBuilder::object_id(Component::Sensor, stream),
        state_topic: topics.detection_count(stream),
        state_class: "measurement",
        icon: "mdi:counter",
        availability,
        device: device.clone(),
    };

    [
        (Component::Camera, serde_json::to_string(&camera)),
        (Component::BinarySensor, serde_json::to_string(&motion)),
        (Component::Sensor, serde_json::to_string(&count)),
    ]
    .into_iter()
    .filter_map(|(component, payload)| match payload {
        Ok(payload) => Some(DiscoveryDocument {
            component,
            topic: topics.discovery(component, stream),
            payload,
        }),
        Err(e) => {
            warn!(
                stream = %stream,
                component = component.as_str(),
                error = %e,
                "Failed to serialize discovery document"
            );
            None
        }
    })
    .collect()
}

/// Streams that get discovery documents
fn discoverable(streams: Vec<StreamInfo>) -> impl Iterator<Item = StreamInfo> {
    streams
        .into_iter()
        .filter(|s| s.enabled && !s.name.is_empty())
}

/// Publish retained discovery documents for every enabled stream
///
/// Returns the number of documents published.
pub fn publish_discovery(
    connection: &ConnectionManager,
    config: &NvrConfig,
    streams: Vec<StreamInfo>,
) -> usize {
    if !config.home_assistant.discovery_enabled || !connection.is_connected() {
        return 0;
    }

    let topics = TopicBuilder::from_config(config);
    let device = DeviceDescriptor::from_config(config);
    let mut published = 0;

    for stream in discoverable(streams) {
        for document in build_stream_documents(&topics, &device, &stream.name) {
            match connection.publish(&document.topic, document.payload.as_bytes(), true) {
                Ok(()) => {
                    metrics().discovery_document_published();
                    published += 1;
                }
                Err(e) => {
                    warn!(topic = %document.topic, error = %e, "Failed to publish discovery document");
                }
            }
        }
        debug!(stream = %stream.name, "Published discovery documents");
    }

    info!(documents = published, "Home Assistant discovery published");
    published
}

/// Publish empty retained configs so Home Assistant removes the stream's entities
pub fn remove_discovery(connection: &ConnectionManager, config: &NvrConfig, stream: &str) -> usize {
    if !config.home_assistant.discovery_enabled || !connection.is_connected() {
        return 0;
    }

    let topics = TopicBuilder::from_config(config);
    [Component::Camera, Component::BinarySensor, Component::Sensor]
        .into_iter()
        .filter(|component| {
            let topic = topics.discovery(*component, stream);
            match connection.publish(&topic, b"", true) {
                Ok(()) => true,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to remove discovery document");
                    false
                }
            }
        })
        .count()
}
