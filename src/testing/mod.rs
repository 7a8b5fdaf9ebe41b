//! Testing utilities and mock implementations
//!
//! Lets the lifecycle, publishing and shutdown logic be exercised without a
//! running MQTT broker.

pub mod mocks;

pub use mocks::*;
