//! MQTT 3.1.1 client used to reach Homie devices through a broker
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! The module is split into four focused sub-modules:
//!
//! - [`connection`] - Pure connection state management and broker options
//! - [`message_handler`] - Pure event routing and QoS decisions
//! - [`health_monitor`] - Pure reconnection logic
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use homie_ota::config::MqttSection;
//! use homie_ota::transport::{mqtt::MqttClient, Transport, TransportEvent};
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     host: "broker.local".to_string(),
//!     ..Default::default()
//! };
//!
//! let mut client = MqttClient::new(&config)?;
//! client.connect().await?;
//! while let Some(event) = client.next_event().await {
//!     if event == TransportEvent::Connected {
//!         client.subscribe("homie/dev1/$state").await?;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{ensure_publish_fits, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
