//! Thread-safe metrics collection
//!
//! Atomic counters for broker traffic, detections, motion transitions,
//! snapshots and teardown, plus the current lifecycle state.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex for the state name
pub struct MetricsCollector {
    // MQTT metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    // Integration metrics
    detection_events: AtomicU64,
    detections_published: AtomicU64,
    discovery_documents: AtomicU64,
    motion_on: AtomicU64,
    motion_off: AtomicU64,
    snapshots_published: AtomicU64,
    snapshot_failures: AtomicU64,

    // Lifecycle metrics
    lifecycle_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    shutdown_timeouts: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            detection_events: AtomicU64::new(0),
            detections_published: AtomicU64::new(0),
            discovery_documents: AtomicU64::new(0),
            motion_on: AtomicU64::new(0),
            motion_off: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            lifecycle_state: Mutex::new("uninitialized".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
            shutdown_timeouts: AtomicU64::new(0),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Integration metrics
    pub fn detections_published(&self, count: u64) {
        self.detection_events.fetch_add(1, Ordering::Relaxed);
        self.detections_published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn discovery_document_published(&self) {
        self.discovery_documents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn motion_turned_on(&self) {
        self.motion_on.fetch_add(1, Ordering::Relaxed);
    }

    pub fn motion_turned_off(&self) {
        self.motion_off.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_published(&self) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_failed(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_lifecycle_state(&self, state: &str) {
        let mut current = self
            .lifecycle_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != state {
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
            *current = state.to_string();
        }
    }

    pub fn shutdown_step_timed_out(&self) {
        self.shutdown_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.messages_published,
            &self.publish_failures,
            &self.connection_start_time,
            &self.detection_events,
            &self.detections_published,
            &self.discovery_documents,
            &self.motion_on,
            &self.motion_off,
            &self.snapshots_published,
            &self.snapshot_failures,
            &self.state_transitions,
            &self.shutdown_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut state) = self.lifecycle_state.lock() {
            *state = "uninitialized".to_string();
        }
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        match self.connection_start_time.load(Ordering::Relaxed) {
            0 => 0,
            start => now.saturating_sub(start),
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let current_state = self
            .lifecycle_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            integration: IntegrationMetrics {
                detection_events: self.detection_events.load(Ordering::Relaxed),
                detections_published: self.detections_published.load(Ordering::Relaxed),
                discovery_documents: self.discovery_documents.load(Ordering::Relaxed),
                motion_on: self.motion_on.load(Ordering::Relaxed),
                motion_off: self.motion_off.load(Ordering::Relaxed),
                snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
                snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                shutdown_timeouts: self.shutdown_timeouts.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub integration: IntegrationMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct IntegrationMetrics {
    pub detection_events: u64,
    pub detections_published: u64,
    pub discovery_documents: u64,
    pub motion_on: u64,
    pub motion_off: u64,
    pub snapshots_published: u64,
    pub snapshot_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub shutdown_timeouts: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_published();

        let metrics = collector.snapshot();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.messages_published, 1);
        assert!(metrics.mqtt.connected);

        collector.mqtt_connection_lost();
        let metrics = collector.snapshot();
        assert!(!metrics.mqtt.connected);
        assert_eq!(metrics.mqtt.connections_lost, 1);
        assert_eq!(metrics.mqtt.connection_duration_seconds, 0);
    }

    #[test]
    fn test_integration_metrics() {
        let collector = MetricsCollector::new();

        collector.detections_published(3);
        collector.detections_published(2);
        collector.motion_turned_on();
        collector.motion_turned_off();
        collector.snapshot_failed();

        let metrics = collector.snapshot();
        assert_eq!(metrics.integration.detection_events, 2);
        assert_eq!(metrics.integration.detections_published, 5);
        assert_eq!(metrics.integration.motion_on, 1);
        assert_eq!(metrics.integration.motion_off, 1);
        assert_eq!(metrics.integration.snapshot_failures, 1);
        assert_eq!(metrics.integration.snapshots_published, 0);
    }

    #[test]
    fn test_state_transitions_only_count_changes() {
        let collector = MetricsCollector::new();

        collector.set_lifecycle_state("running");
        collector.set_lifecycle_state("running");
        collector.set_lifecycle_state("stopped");

        let metrics = collector.snapshot();
        assert_eq!(metrics.lifecycle.current_state, "stopped");
        assert_eq!(metrics.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.mqtt_message_published();
                        collector.shutdown_step_timed_out();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.mqtt.messages_published, 1000);
        assert_eq!(metrics.lifecycle.shutdown_timeouts, 1000);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_established();
        collector.discovery_document_published();
        collector.set_lifecycle_state("running");

        collector.reset();

        let metrics = collector.snapshot();
        assert!(!metrics.mqtt.connected);
        assert_eq!(metrics.integration.discovery_documents, 0);
        assert_eq!(metrics.lifecycle.current_state, "uninitialized");
        assert_eq!(metrics.lifecycle.state_transitions, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert_eq!(json["lifecycle"]["current_state"], "uninitialized");
        assert_eq!(json["mqtt"]["connected"], false);
    }
}
