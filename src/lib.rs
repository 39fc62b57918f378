//! homie-ota - over-the-air firmware updates for Homie devices
//!
//! Pushes a firmware image to a Homie 3.0 device through an MQTT broker and
//! follows the device's OTA status until it comes back with the new
//! firmware.
//!
//! # Overview
//!
//! - [`firmware`] loads an image, computes its MD5 checksum and extracts the
//!   Homie metadata markers
//! - [`protocol`] knows the device topic layout and parses device messages
//! - [`ota`] holds the update state machine and the orchestrator that runs
//!   it over a [`transport::Transport`]
//! - [`transport::mqtt`] is the MQTT 3.1.1 transport
//! - [`progress`] renders transfer progress for the operator
//!
//! # Quick Start
//!
//! ```rust
//! use homie_ota::firmware::Firmware;
//! use homie_ota::ota::{OtaOrchestrator, Outcome, RunOptions, Session};
//! use homie_ota::testing::MockTransport;
//! use homie_ota::transport::TransportEvent;
//! use bytes::Bytes;
//!
//! # tokio_test::block_on(async {
//! let firmware = Firmware::from_bytes(b"image".to_vec()).unwrap();
//! let checksum = firmware.checksum().to_string();
//! let session = Session::new("homie/", "kitchen-light", firmware, None);
//!
//! // The device already runs this image
//! let transport = MockTransport::new(vec![
//!     TransportEvent::Connected,
//!     TransportEvent::Message {
//!         topic: "homie/kitchen-light/$state".to_string(),
//!         payload: Bytes::from_static(b"ready"),
//!         retained: true,
//!     },
//!     TransportEvent::Message {
//!         topic: "homie/kitchen-light/$fw/checksum".to_string(),
//!         payload: Bytes::from(checksum),
//!         retained: true,
//!     },
//! ]);
//!
//! let report = OtaOrchestrator::new(transport, session, RunOptions::default())
//!     .run(std::future::pending())
//!     .await;
//! assert_eq!(report.outcome, Outcome::UpToDate);
//! # });
//! ```

pub mod config;
pub mod error;
pub mod firmware;
pub mod observability;
pub mod ota;
pub mod progress;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConfigOverrides, UpdaterConfig};
pub use error::{OtaError, OtaResult};
pub use firmware::{Firmware, FirmwareMetadata};
pub use ota::{OtaOrchestrator, OtaReport, Outcome, RunOptions, Session};
pub use progress::{Progress, ProgressView, TerminalProgress};
pub use transport::mqtt::MqttClient;
pub use transport::{Transport, TransportEvent};
