//! Detection events and pass-through publishing

use super::connection::ConnectionManager;
use crate::detection::{DetectionEvent, DetectionResult};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::metrics;
use crate::topics::TopicBuilder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Publishes through the shared connection; cheap to clone
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// `Ok(true)` if a publish should be attempted, `Ok(false)` if inert
    fn ready(&self) -> MqttResult<bool> {
        if self.connection.is_shutting_down() {
            return Err(MqttError::ShuttingDown);
        }
        match self.connection.config() {
            Some(config) if config.mqtt.enabled => {}
            _ => return Ok(false),
        }
        if !self.connection.is_connected() {
            return Err(MqttError::NotConnected);
        }
        Ok(true)
    }

    /// Publish a detection batch to `{prefix}/detections/{stream}`
    ///
    /// Empty results and an uninitialized or disabled integration are no-ops.
    pub fn publish_detection(
        &self,
        stream: &str,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> MqttResult<()> {
        if self.connection.is_shutting_down() {
            return Err(MqttError::ShuttingDown);
        }
        let Some(config) = self.connection.config() else {
            return Ok(());
        };
        if !config.mqtt.enabled || stream.is_empty() || result.is_empty() {
            return Ok(());
        }
        if !self.ready()? {
            return Ok(());
        }

        let payload = DetectionEvent::new(stream, result, timestamp).to_json()?;
        let topic = TopicBuilder::from_config(&config).detections(stream);
        self.connection
            .publish(&topic, payload.as_bytes(), config.mqtt.retain)?;

        metrics().detections_published(result.count() as u64);
        debug!(stream = %stream, count = result.count(), "Published detection event");
        Ok(())
    }

    /// Publish a text payload to an arbitrary topic
    pub fn publish_raw(&self, topic: &str, payload: &str, retain: bool) -> MqttResult<()> {
        self.publish_binary(topic, payload.as_bytes(), retain)
    }

    /// Publish bytes to an arbitrary topic
    pub fn publish_binary(&self, topic: &str, payload: &[u8], retain: bool) -> MqttResult<()> {
        if !self.ready()? {
            return Ok(());
        }
        self.connection.publish(topic, payload, retain)
    }
}
