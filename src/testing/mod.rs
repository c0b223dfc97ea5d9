//! Testing utilities and mock implementations
//!
//! Lets the broker link be exercised end to end without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
