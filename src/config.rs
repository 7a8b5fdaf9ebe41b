//! Configuration for the NVR MQTT integration
//!
//! Settings are loaded from a TOML file. Secrets are never stored in the file:
//! the broker password is resolved at runtime from the environment variable
//! named by `mqtt.password_env`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum number of configured camera streams.
pub const MAX_STREAMS: usize = 16;

/// Shortest keepalive the broker session accepts.
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NvrConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub home_assistant: HomeAssistantSection,
    #[serde(default)]
    pub snapshots: SnapshotSection,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Broker connection and publishing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Master switch; when false the whole integration stays inert
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Client identifier; a random one is generated when unset
    pub client_id: Option<String>,
    pub username: Option<String>,
    /// Environment variable containing the broker password
    pub password_env: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// QoS used for detection and pass-through publishes (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Retain flag for detection events
    #[serde(default)]
    pub retain: bool,
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_topic_prefix() -> String {
    "lightnvr".to_string()
}

fn default_qos() -> u8 {
    1
}

/// Home Assistant discovery and background service settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomeAssistantSection {
    #[serde(default)]
    pub discovery_enabled: bool,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Node id used in discovery topics and as the device identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Seconds between snapshot publications (0 disables the snapshot loop)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Seconds without detections before motion flips OFF (0 disables the watchdog)
    #[serde(default = "default_motion_timeout")]
    pub motion_timeout_secs: u64,
    /// Link shown on the Home Assistant device page
    pub configuration_url: Option<String>,
}

impl Default for HomeAssistantSection {
    fn default() -> Self {
        Self {
            discovery_enabled: false,
            discovery_prefix: default_discovery_prefix(),
            node_id: default_node_id(),
            snapshot_interval_secs: default_snapshot_interval(),
            motion_timeout_secs: default_motion_timeout(),
            configuration_url: None,
        }
    }
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_node_id() -> String {
    "lightnvr".to_string()
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_motion_timeout() -> u64 {
    30
}

/// Where the file-backed snapshot source looks for `{stream}.jpg`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSection {
    pub directory: Option<PathBuf>,
}

/// One camera stream known to the recorder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("MQTT integration is disabled")]
    MqttDisabled,
    #[error("MQTT broker host is not configured")]
    MissingBrokerHost,
}

impl NvrConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NvrConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation that does not depend on `mqtt.enabled`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                mqtt.qos
            )));
        }
        if mqtt.keepalive_secs < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keepalive_secs must be at least {MIN_KEEPALIVE_SECS}"
            )));
        }
        validate_topic_segment("mqtt.topic_prefix", &mqtt.topic_prefix)?;

        let ha = &self.home_assistant;
        validate_topic_segment("home_assistant.discovery_prefix", &ha.discovery_prefix)?;
        validate_topic_segment("home_assistant.node_id", &ha.node_id)?;

        if self.streams.len() > MAX_STREAMS {
            return Err(ConfigError::InvalidConfig(format!(
                "at most {MAX_STREAMS} streams are supported (got {})",
                self.streams.len()
            )));
        }
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
        }
        Ok(())
    }

    /// Checks needed before a broker session can be created
    pub fn validate_for_connection(&self) -> Result<(), ConfigError> {
        if !self.mqtt.enabled {
            return Err(ConfigError::MqttDisabled);
        }
        if self.mqtt.broker_host.trim().is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        self.validate()
    }

    /// Broker password from the configured environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mqtt
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Configured client id, or a fresh random one
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("nvr-mqtt-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Create a test configuration with a local broker and discovery enabled
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            mqtt: MqttSection {
                enabled: true,
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: Some("nvr-test".to_string()),
                username: None,
                password_env: None,
                tls_enabled: false,
                keepalive_secs: 60,
                topic_prefix: "lightnvr".to_string(),
                qos: 1,
                retain: false,
            },
            home_assistant: HomeAssistantSection {
                discovery_enabled: true,
                ..Default::default()
            },
            snapshots: SnapshotSection::default(),
            streams: vec![StreamConfig {
                name: "Front Door".to_string(),
                enabled: true,
            }],
        }
    }
}

fn validate_topic_segment(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidConfig(format!("{field} must not be empty")));
    }
    if value.contains(['+', '#']) {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} must not contain MQTT wildcards"
        )));
    }
    Ok(())
}
