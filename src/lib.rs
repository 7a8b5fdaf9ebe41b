//! NVR MQTT - broker integration for a network video recorder
//!
//! Publishes object-detection events to an MQTT broker, advertises each
//! camera stream to Home Assistant through MQTT discovery, tracks per-stream
//! motion state and tears the broker session down within a bounded time.
//!
//! # Overview
//!
//! - [`config`] - TOML configuration and validation
//! - [`detection`] - detection records and the event payload
//! - [`topics`] - topic layout and identifier sanitizing
//! - [`transport`] - broker session abstraction and the rumqttc backend
//! - [`integration`] - connection lifecycle, publishing, discovery, motion,
//!   background services and shutdown
//! - [`collaborators`] - stream list and snapshot sources supplied by the recorder
//! - [`observability`] - structured logging and metrics
//!
//! # Quick Start
//!
//! ```rust
//! use nvr_mqtt::detection::{Detection, DetectionEvent, DetectionResult};
//! use chrono::{TimeZone, Utc};
//!
//! let result = DetectionResult::new(vec![
//!     Detection::new("person", 0.92).with_bounds(0.1, 0.2, 0.3, 0.4),
//! ]);
//! let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
//!
//! let json = DetectionEvent::new("Front Door", &result, timestamp)
//!     .to_json()
//!     .unwrap();
//! assert!(json.contains("\"stream\":\"Front Door\""));
//! ```

pub mod collaborators;
pub mod config;
pub mod detection;
pub mod error;
pub mod integration;
pub mod observability;
pub mod testing;
pub mod topics;
pub mod transport;

pub use collaborators::{SnapshotSource, StreamInfo, StreamStore};
pub use config::{ConfigError, NvrConfig};
pub use detection::{Detection, DetectionEvent, DetectionResult};
pub use error::{MqttError, MqttResult};
pub use integration::{MqttIntegration, ShutdownOutcome, ShutdownPolicy};
pub use topics::TopicBuilder;
pub use transport::mqtt::RumqttBackend;
