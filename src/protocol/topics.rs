//! Topic construction and device ID validation for the Homie 3.0 convention
//!
//! Every topic the updater touches lives under `{base_topic}{device_id}/`.
//! The base topic is normalised to always end with exactly one `/`.

use thiserror::Error;

/// Device lifecycle topic (Homie 3.0 `$state`)
pub const STATE: &str = "$state";
/// OTA enablement flag published by the device
pub const OTA_ENABLED: &str = "$implementation/ota/enabled";
/// OTA progress / result status published by the device
pub const OTA_STATUS: &str = "$implementation/ota/status";
/// MD5 of the firmware currently running on the device
pub const FW_CHECKSUM: &str = "$fw/checksum";
/// Name of the firmware currently running on the device
pub const FW_NAME: &str = "$fw/name";
/// Version of the firmware currently running on the device
pub const FW_VERSION: &str = "$fw/version";
/// Prefix of the firmware publish target; the checksum is appended
pub const OTA_FIRMWARE_PREFIX: &str = "$implementation/ota/firmware/";

/// Ensure a base topic ends with a single `/`
pub fn normalize_base_topic(base_topic: &str) -> String {
    let trimmed = base_topic.trim_end_matches('/');
    format!("{trimmed}/")
}

/// Validate a device ID against the Homie 3.0 ID rules: `[a-z0-9-]+`,
/// no leading or trailing hyphen.
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    if device_id.starts_with('-') || device_id.ends_with('-') {
        return Err(ValidationError::HyphenAtEdge(device_id.to_string()));
    }

    Ok(())
}

/// Validation errors for Homie identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Device ID '{0}' cannot start or end with a hyphen")]
    HyphenAtEdge(String),
}

/// Builds absolute topics for one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTopics {
    root: String,
}

impl DeviceTopics {
    pub fn new(base_topic: &str, device_id: &str) -> Self {
        Self {
            root: format!("{}{device_id}/", normalize_base_topic(base_topic)),
        }
    }

    /// Device topic root, always `/`-terminated
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute topic for a path relative to the device root
    pub fn topic(&self, relative: &str) -> String {
        format!("{}{relative}", self.root)
    }

    /// Strip the device root from an absolute topic
    pub fn relative<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(self.root.as_str())
    }

    /// Lifecycle topic subscribed right after the broker connection comes up
    pub fn online_topics(&self) -> Vec<String> {
        vec![self.topic(STATE)]
    }

    /// Topics subscribed once the device reports `ready`
    pub fn device_info_topics(&self) -> Vec<String> {
        [OTA_STATUS, OTA_ENABLED, FW_CHECKSUM, FW_NAME, FW_VERSION]
            .iter()
            .map(|t| self.topic(t))
            .collect()
    }

    /// Publish target for a firmware image: `.../$implementation/ota/firmware/{checksum}`
    pub fn firmware_topic(&self, checksum: &str) -> String {
        self.topic(&format!("{OTA_FIRMWARE_PREFIX}{checksum}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_base_topic_is_idempotent(topic in "[a-z/]{0,20}") {
            let first = normalize_base_topic(&topic);
            let second = normalize_base_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn normalized_base_topic_ends_with_one_slash(topic in "[a-z/]{0,20}") {
            let result = normalize_base_topic(&topic);
            prop_assert!(result.ends_with('/'));
            prop_assert!(!result.ends_with("//"));
        }
    }

    #[test]
    fn test_normalize_base_topic() {
        assert_eq!(normalize_base_topic("homie"), "homie/");
        assert_eq!(normalize_base_topic("homie/"), "homie/");
        assert_eq!(normalize_base_topic("homie//"), "homie/");
        assert_eq!(normalize_base_topic("site/homie"), "site/homie/");
    }

    #[test]
    fn test_device_topics() {
        let topics = DeviceTopics::new("homie", "kitchen-light");
        assert_eq!(topics.root(), "homie/kitchen-light/");
        assert_eq!(topics.topic(STATE), "homie/kitchen-light/$state");
        assert_eq!(
            topics.firmware_topic("def456"),
            "homie/kitchen-light/$implementation/ota/firmware/def456"
        );
    }

    #[test]
    fn test_relative_topic() {
        let topics = DeviceTopics::new("homie/", "dev1");
        assert_eq!(topics.relative("homie/dev1/$fw/checksum"), Some("$fw/checksum"));
        assert_eq!(topics.relative("homie/dev10/$fw/checksum"), None);
        assert_eq!(topics.relative("other/dev1/$state"), None);
    }

    #[test]
    fn test_device_info_topics() {
        let topics = DeviceTopics::new("homie/", "dev1");
        let info = topics.device_info_topics();
        assert!(info.contains(&"homie/dev1/$implementation/ota/status".to_string()));
        assert!(info.contains(&"homie/dev1/$implementation/ota/enabled".to_string()));
        assert!(info.contains(&"homie/dev1/$fw/checksum".to_string()));
        assert_eq!(topics.online_topics(), vec!["homie/dev1/$state"]);
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("kitchen-light-2").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("Kitchen"),
            Err(ValidationError::InvalidDeviceIdChar('K'))
        );
        assert_eq!(
            validate_device_id("dev_1"),
            Err(ValidationError::InvalidDeviceIdChar('_'))
        );
        assert!(matches!(
            validate_device_id("-dev"),
            Err(ValidationError::HyphenAtEdge(_))
        ));
    }
}
