//! Topic construction for detection, state, availability and discovery topics

use crate::config::NvrConfig;

/// Home Assistant entity components published per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Camera,
    BinarySensor,
    Sensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Camera => "camera",
            Component::BinarySensor => "binary_sensor",
            Component::Sensor => "sensor",
        }
    }

    /// Suffix appended to the sanitized stream id in the object id
    fn object_suffix(&self) -> &'static str {
        match self {
            Component::Camera => "",
            Component::BinarySensor => "_motion",
            Component::Sensor => "_detection_count",
        }
    }
}

/// Lowercase `name` and replace every character outside `[a-z0-9]` with `_`
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds every topic the integration publishes to
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    prefix: String,
    discovery_prefix: String,
    node_id: String,
}

impl TopicBuilder {
    pub fn new(
        prefix: impl Into<String>,
        discovery_prefix: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
            node_id: node_id.into(),
        }
    }

    pub fn from_config(config: &NvrConfig) -> Self {
        Self::new(
            config.mqtt.topic_prefix.clone(),
            config.home_assistant.discovery_prefix.clone(),
            config.home_assistant.node_id.clone(),
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// `{prefix}/detections/{stream}`
    pub fn detections(&self, stream: &str) -> String {
        format!("{}/detections/{stream}", self.prefix)
    }

    /// `{prefix}/availability`
    pub fn availability(&self) -> String {
        format!("{}/availability", self.prefix)
    }

    /// `{prefix}/cameras/{stream}/motion`
    pub fn motion(&self, stream: &str) -> String {
        self.camera_state(stream, "motion")
    }

    /// `{prefix}/cameras/{stream}/detection_count`
    pub fn detection_count(&self, stream: &str) -> String {
        self.camera_state(stream, "detection_count")
    }

    /// `{prefix}/cameras/{stream}/snapshot`
    pub fn snapshot(&self, stream: &str) -> String {
        self.camera_state(stream, "snapshot")
    }

    /// `{prefix}/cameras/{stream}/{label}` with the label sanitized
    pub fn label_count(&self, stream: &str, label: &str) -> String {
        self.camera_state(stream, &sanitize_identifier(label))
    }

    fn camera_state(&self, stream: &str, leaf: &str) -> String {
        format!("{}/cameras/{stream}/{leaf}", self.prefix)
    }

    /// Object id used in unique ids and discovery topics
    pub fn object_id(component: Component, stream: &str) -> String {
        format!("{}{}", sanitize_identifier(stream), component.object_suffix())
    }

    /// `{discovery_prefix}/{component}/{node_id}/{object_id}/config`
    pub fn discovery(&self, component: Component, stream: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix,
            component.as_str(),
            self.node_id,
            Self::object_id(component, stream)
        )
    }
}
