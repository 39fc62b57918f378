//! Transport layer for device communication
//!
//! This module provides the transport abstraction the OTA orchestrator runs
//! on, plus the MQTT implementation.

use bytes::Bytes;

pub mod mqtt;

/// Events surfaced by a transport, delivered one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection (initial or after a reconnect)
    Connected,
    /// The first connection attempt failed
    ConnectionRefused(String),
    /// A message arrived on a subscribed topic
    Message {
        topic: String,
        payload: Bytes,
        retained: bool,
    },
    /// Connection dropped; the transport is retrying
    Reconnecting { attempt: u32 },
    /// Connection dropped and retries are exhausted
    ConnectionLost(String),
}

/// Transport trait for device communication
///
/// This trait provides an abstraction over the pub/sub transport (primarily
/// MQTT) so the orchestrator can be driven by a scripted transport in tests.
/// Events are pulled one at a time, which keeps all session handling on a
/// single task.
#[async_trait::async_trait]
pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start connecting; the outcome arrives as a [`TransportEvent`]
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to an absolute topic
    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    /// Publish a payload to an absolute topic
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Flush pending publishes and disconnect from the broker
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Wait for the next event. Returns `None` once the transport is closed.
    /// Must be cancel safe.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;
}

