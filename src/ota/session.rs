//! Per-update session record
//!
//! A [`Session`] is created right before the transport connects and is owned
//! by a single state machine for its whole lifetime. It carries what is
//! known locally (firmware, checksum, metadata) and what the device has
//! reported so far.

use super::outcome::Outcome;
use crate::firmware::{Firmware, FirmwareMetadata};
use crate::protocol::{normalize_base_topic, DeviceTopics};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Firmware identity reported by the device on `$fw/name` and `$fw/version`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteFirmware {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    base_topic: String,
    device_id: String,
    topics: DeviceTopics,
    firmware: Firmware,
    metadata: Option<FirmwareMetadata>,
    remote_old_checksum: Option<String>,
    remote_firmware: RemoteFirmware,
    ota_enabled: bool,
    published: bool,
    outcome: Option<Outcome>,
}

impl Session {
    pub fn new(
        base_topic: &str,
        device_id: &str,
        firmware: Firmware,
        metadata: Option<FirmwareMetadata>,
    ) -> Self {
        let base_topic = normalize_base_topic(base_topic);
        let topics = DeviceTopics::new(&base_topic, device_id);
        Self {
            base_topic,
            device_id: device_id.to_string(),
            topics,
            firmware,
            metadata,
            remote_old_checksum: None,
            remote_firmware: RemoteFirmware::default(),
            ota_enabled: false,
            published: false,
            outcome: None,
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// Local firmware checksum
    pub fn checksum(&self) -> &str {
        self.firmware.checksum()
    }

    pub fn metadata(&self) -> Option<&FirmwareMetadata> {
        self.metadata.as_ref()
    }

    pub fn remote_old_checksum(&self) -> Option<&str> {
        self.remote_old_checksum.as_deref()
    }

    pub fn remote_firmware(&self) -> &RemoteFirmware {
        &self.remote_firmware
    }

    pub fn ota_enabled(&self) -> bool {
        self.ota_enabled
    }

    /// True once the push was attempted, whether or not the transport took it
    pub fn published(&self) -> bool {
        self.published
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub(crate) fn set_ota_enabled(&mut self) {
        self.ota_enabled = true;
    }

    pub(crate) fn set_remote_old_checksum(&mut self, checksum: String) {
        self.remote_old_checksum = Some(checksum);
    }

    pub(crate) fn remote_firmware_mut(&mut self) -> &mut RemoteFirmware {
        &mut self.remote_firmware
    }

    /// The publish condition: not yet published, OTA enabled, and a known
    /// remote checksum that differs from ours.
    pub fn should_publish(&self) -> bool {
        !self.published
            && self.ota_enabled
            && self
                .remote_old_checksum
                .as_deref()
                .is_some_and(|remote| remote != self.checksum())
    }

    /// Flip `published` to true. Returns false if it already was.
    pub(crate) fn mark_published(&mut self) -> bool {
        if self.published {
            return false;
        }
        self.published = true;
        true
    }

    /// Record the terminal outcome. The first outcome wins; later attempts
    /// are logged and dropped.
    pub(crate) fn set_outcome(&mut self, outcome: Outcome) -> bool {
        if let Some(existing) = &self.outcome {
            warn!(
                existing = %existing,
                rejected = %outcome,
                "Session outcome already set, ignoring"
            );
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Publish target for this session's firmware
    pub fn firmware_topic(&self) -> String {
        self.topics.firmware_topic(self.checksum())
    }

    pub fn firmware_payload(&self) -> Bytes {
        self.firmware.bytes().clone()
    }

    /// Operator banner printed when the firmware is pushed
    pub fn flash_banner(&self) -> String {
        match &self.metadata {
            Some(meta) => format!(
                "Flashing firmware {} / {} / version:{} / checksum:{}",
                meta.name,
                meta.brand,
                meta.version,
                self.checksum()
            ),
            None => format!(
                "Flashing unrecognized firmware ({} bytes) / checksum:{}",
                self.firmware.len(),
                self.checksum()
            ),
        }
    }
}
