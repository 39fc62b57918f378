//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising OTA sessions
//! without an MQTT broker or a real device.

pub mod mocks;

pub use mocks::*;
