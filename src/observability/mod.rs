//! Observability for the NVR MQTT integration
//!
//! Structured logging through `tracing` and process-wide counters for broker
//! traffic and the integration lifecycle.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span, shutdown_span};
