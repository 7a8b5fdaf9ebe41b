//! Error types for the MQTT integration

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by connection, publishing and lifecycle operations
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to MQTT broker")]
    NotConnected,

    #[error("MQTT integration is shutting down")]
    ShuttingDown,

    #[error("MQTT integration is already initialized")]
    AlreadyInitialized,

    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Broker client error")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl MqttError {
    /// Create a publish failure for `topic`
    pub fn publish_failed<E>(topic: &str, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::PublishFailed {
            topic: topic.to_string(),
            source: source.into(),
        }
    }

    /// Wrap an error from the underlying broker library
    pub fn client<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Client(source.into())
    }
}

pub type MqttResult<T> = Result<T, MqttError>;
