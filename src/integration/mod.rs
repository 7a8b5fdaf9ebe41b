//! NVR MQTT integration
//!
//! [`MqttIntegration`] owns one broker connection and everything built on it:
//!
//! - [`connection`] - session lifecycle and the connected flag
//! - [`publisher`] - detection events and pass-through publishes
//! - [`discovery`] - Home Assistant discovery documents
//! - [`motion`] - per-stream motion state
//! - [`services`] - snapshot and motion-timeout workers
//! - [`shutdown`] - bounded teardown
//!
//! # Usage
//!
//! ```rust,no_run
//! use nvr_mqtt::collaborators::{ConfigStreamStore, NoSnapshots};
//! use nvr_mqtt::config::NvrConfig;
//! use nvr_mqtt::integration::MqttIntegration;
//! use nvr_mqtt::transport::mqtt::RumqttBackend;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NvrConfig::load_from_file("nvr-mqtt.toml".as_ref())?;
//! let integration = MqttIntegration::new(
//!     Arc::new(RumqttBackend::default()),
//!     Arc::new(ConfigStreamStore::from_config(&config)),
//!     Arc::new(NoSnapshots),
//! );
//! integration.init(config)?;
//! integration.connect()?;
//! integration.start_services();
//! // ...
//! integration.cleanup();
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod discovery;
pub mod motion;
pub mod publisher;
pub mod services;
pub mod shutdown;

pub use connection::ConnectionManager;
pub use motion::{LabelCount, MotionSnapshot, MotionTracker};
pub use publisher::Publisher;
pub use services::ServiceRunner;
pub use shutdown::{run_with_timeout, ShutdownController, ShutdownOutcome, ShutdownPolicy};

use crate::collaborators::{SnapshotSource, StreamStore};
use crate::config::NvrConfig;
use crate::detection::DetectionResult;
use crate::error::MqttResult;
use crate::observability::metrics::metrics;
use crate::topics::TopicBuilder;
use crate::transport::BrokerBackend;
use chrono::{DateTime, Utc};
use services::ServiceContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// The MQTT subsystem of the recorder
pub struct MqttIntegration {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    motion: Arc<MotionTracker>,
    services: ServiceRunner,
    shutdown: ShutdownController,
    streams: Arc<dyn StreamStore>,
    snapshots: Arc<dyn SnapshotSource>,
    cleaned_up: AtomicBool,
}

impl MqttIntegration {
    pub fn new(
        backend: Arc<dyn BrokerBackend>,
        streams: Arc<dyn StreamStore>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let connection = ConnectionManager::new(backend);
        Self {
            publisher: Publisher::new(connection.clone()),
            connection,
            motion: Arc::new(MotionTracker::new()),
            services: ServiceRunner::default(),
            shutdown: ShutdownController::default(),
            streams,
            snapshots,
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = ShutdownController::new(policy);
        self
    }

    /// Polling granularity of the background workers
    pub fn with_service_tick(mut self, tick: Duration) -> Self {
        self.services = ServiceRunner::new(tick);
        self
    }

    /// Active configuration, only when MQTT is enabled
    fn enabled_config(&self) -> Option<Arc<NvrConfig>> {
        self.connection.config().filter(|c| c.mqtt.enabled)
    }

    pub fn init(&self, config: NvrConfig) -> MqttResult<()> {
        let _span = crate::lifecycle_span!(transition = "init").entered();
        metrics().set_lifecycle_state("initializing");
        self.connection.init(Arc::new(config))?;
        metrics().set_lifecycle_state("initialized");
        Ok(())
    }

    pub fn connect(&self) -> MqttResult<()> {
        self.connection.connect()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn publish_detection(
        &self,
        stream: &str,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> MqttResult<()> {
        self.publisher.publish_detection(stream, result, timestamp)
    }

    pub fn publish_raw(&self, topic: &str, payload: &str, retain: bool) -> MqttResult<()> {
        self.publisher.publish_raw(topic, payload, retain)
    }

    pub fn publish_binary(&self, topic: &str, payload: &[u8], retain: bool) -> MqttResult<()> {
        self.publisher.publish_binary(topic, payload, retain)
    }

    /// Publish Home Assistant discovery for every enabled stream
    pub fn publish_discovery(&self) -> usize {
        match self.enabled_config() {
            Some(config) => {
                discovery::publish_discovery(&self.connection, &config, self.streams.list_streams())
            }
            None => 0,
        }
    }

    /// Remove a stream's Home Assistant entities
    pub fn remove_discovery(&self, stream: &str) -> usize {
        match self.enabled_config() {
            Some(config) => discovery::remove_discovery(&self.connection, &config, stream),
            None => 0,
        }
    }

    /// Record detections for `stream` and publish its motion state
    pub fn set_motion_state(&self, stream: &str, result: &DetectionResult) {
        let Some(config) = self.enabled_config() else {
            return;
        };
        if !config.home_assistant.discovery_enabled {
            return;
        }
        if let Some(update) = self.motion.record_detection(stream, result, Instant::now()) {
            motion::publish_motion_update(
                &self.connection,
                &TopicBuilder::from_config(&config),
                &update,
            );
        }
    }

    /// Force `stream` to motion OFF immediately
    pub fn clear_motion_state(&self, stream: &str) {
        let Some(config) = self.enabled_config() else {
            return;
        };
        if !config.home_assistant.discovery_enabled {
            return;
        }
        if let Some(expired) = self.motion.clear(stream) {
            motion::publish_motion_off(
                &self.connection,
                &TopicBuilder::from_config(&config),
                &expired,
            );
        }
    }

    pub fn motion_state(&self, stream: &str) -> Option<MotionSnapshot> {
        self.motion.snapshot(stream)
    }

    /// Start the snapshot and motion-timeout workers
    ///
    /// Returns the number of workers started.
    pub fn start_services(&self) -> usize {
        let Some(config) = self.enabled_config() else {
            return 0;
        };
        if !config.home_assistant.discovery_enabled || self.connection.is_shutting_down() {
            return 0;
        }

        let ha = &config.home_assistant;
        let started = self.services.start(ServiceContext {
            connection: self.connection.clone(),
            motion: self.motion.clone(),
            streams: self.streams.clone(),
            snapshots: self.snapshots.clone(),
            topics: TopicBuilder::from_config(&config),
            snapshot_interval: Duration::from_secs(ha.snapshot_interval_secs),
            motion_timeout: Duration::from_secs(ha.motion_timeout_secs),
        });
        if started > 0 {
            metrics().set_lifecycle_state("running");
        }
        started
    }

    pub fn stop_services(&self) {
        self.services.stop();
    }

    /// Gracefully disconnect, keeping the session for a later reconnect
    pub fn disconnect(&self) -> ShutdownOutcome {
        if self.enabled_config().is_none() {
            return ShutdownOutcome::Clean;
        }
        self.shutdown.disconnect(&self.connection)
    }

    /// Terminal teardown; later calls return `Clean` without doing anything
    pub fn cleanup(&self) -> ShutdownOutcome {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            info!("MQTT cleanup already performed");
            return ShutdownOutcome::Clean;
        }
        let _span = crate::lifecycle_span!(transition = "cleanup").entered();
        metrics().set_lifecycle_state("stopping");
        let outcome = self.shutdown.shutdown(&self.connection, &self.services);
        metrics().set_lifecycle_state(if outcome.is_clean() {
            "stopped"
        } else {
            "stopped_degraded"
        });
        outcome
    }
}
