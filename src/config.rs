//! Configuration for the OTA updater
//!
//! Values come from an optional TOML file and are then overridden by CLI
//! flags. Every field has a default, so an empty file is a valid config.

use crate::protocol::{normalize_base_topic, validate_device_id, ValidationError};
use crate::transport::mqtt::{HealthMonitor, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholder written in place of secrets when a config is displayed
pub const REDACTED: &str = "********";

/// Main updater configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdaterConfig {
    pub mqtt: MqttSection,
    pub device: DeviceSection,
    pub ota: OtaSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable holding the password, used when `password` is unset
    pub password_env: Option<String>,
    /// CA bundle; enables TLS when present
    pub tls_ca_cert: Option<PathBuf>,
    pub keep_alive_secs: u64,
    /// Largest MQTT packet accepted or sent, in bytes
    pub max_packet_size: usize,
    pub client_id_prefix: String,
    pub reconnect: ReconnectSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            password_env: None,
            tls_ca_cert: None,
            keep_alive_secs: 60,
            max_packet_size: 4 * 1024 * 1024,
            client_id_prefix: "homie-ota".to_string(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl MqttSection {
    /// Password from the config, falling back to `password_env`
    pub fn resolve_password(&self) -> Option<String> {
        self.password.clone().or_else(|| {
            self.password_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

/// Reconnection policy once a connection has been established
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// None retries forever
    pub max_attempts: Option<u32>,
    pub backoff_ms: Vec<u64>,
    pub sustained_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            backoff_ms: vec![250, 500, 1000, 2000],
            sustained_ms: 2000,
        }
    }
}

/// Target device settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSection {
    pub base_topic: String,
    pub device_id: Option<String>,
    pub firmware: Option<PathBuf>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            base_topic: "homie/".to_string(),
            device_id: None,
            firmware: None,
        }
    }
}

/// Session timing and policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaSection {
    pub online_timeout_secs: u64,
    /// 0 waits for confirmation indefinitely
    pub confirmation_timeout_secs: u64,
    /// Push images that carry no Homie magic marker
    pub allow_unrecognized: bool,
}

impl Default for OtaSection {
    fn default() -> Self {
        Self {
            online_timeout_secs: 60,
            confirmation_timeout_secs: 300,
            allow_unrecognized: false,
        }
    }
}

impl OtaSection {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_secs(self.online_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Option<Duration> {
        (self.confirmation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.confirmation_timeout_secs))
    }
}

/// Values supplied on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca_cert: Option<PathBuf>,
    pub base_topic: Option<String>,
    pub device_id: Option<String>,
    pub firmware: Option<PathBuf>,
    pub online_timeout_secs: Option<u64>,
    pub allow_unrecognized: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(#[from] ValidationError),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl UpdaterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: UpdaterConfig = toml::from_str(content)?;
        config.device.base_topic = normalize_base_topic(&config.device.base_topic);
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Layer CLI values over the file values
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            host,
            port,
            username,
            password,
            tls_ca_cert,
            base_topic,
            device_id,
            firmware,
            online_timeout_secs,
            allow_unrecognized,
        } = overrides;

        if let Some(host) = host {
            self.mqtt.host = host;
        }
        if let Some(port) = port {
            self.mqtt.port = port;
        }
        if username.is_some() {
            self.mqtt.username = username;
        }
        if password.is_some() {
            self.mqtt.password = password;
        }
        if tls_ca_cert.is_some() {
            self.mqtt.tls_ca_cert = tls_ca_cert;
        }
        if let Some(base_topic) = base_topic {
            self.device.base_topic = normalize_base_topic(&base_topic);
        }
        if device_id.is_some() {
            self.device.device_id = device_id;
        }
        if firmware.is_some() {
            self.device.firmware = firmware;
        }
        if let Some(secs) = online_timeout_secs {
            self.ota.online_timeout_secs = secs;
        }
        if allow_unrecognized {
            self.ota.allow_unrecognized = true;
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.host cannot be empty".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be non-zero".to_string(),
            ));
        }
        if self.mqtt.client_id_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id_prefix cannot be empty".to_string(),
            ));
        }
        HealthMonitor::validate_reconnect_config(&ReconnectConfig::from(&self.mqtt.reconnect))
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.reconnect {e}")))?;
        if self.ota.online_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "ota.online_timeout_secs must be non-zero".to_string(),
            ));
        }
        if let Some(device_id) = &self.device.device_id {
            validate_device_id(device_id)?;
        }
        Ok(())
    }

    /// Device id and firmware path, both required for an update
    pub fn update_target(&self) -> Result<(&str, &Path), ConfigError> {
        let device_id = self
            .device
            .device_id
            .as_deref()
            .ok_or(ConfigError::Missing("device id (--device-id or [device].device_id)"))?;
        validate_device_id(device_id)?;
        let firmware = self
            .device
            .firmware
            .as_deref()
            .ok_or(ConfigError::Missing("firmware path (--firmware or [device].firmware)"))?;
        Ok((device_id, firmware))
    }

    /// Effective configuration as TOML with secrets replaced
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.mqtt.password.is_some() {
            shown.mqtt.password = Some(REDACTED.to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
host = "broker.local"
port = 1884

[device]
base_topic = "devices"
device_id = "kitchen-light"
firmware = "firmware.bin"
"#;
        Self::from_toml(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = UpdaterConfig::from_toml("").unwrap();
        assert_eq!(config, UpdaterConfig::default());
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.max_packet_size, 4 * 1024 * 1024);
        assert_eq!(config.device.base_topic, "homie/");
        assert_eq!(config.ota.online_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.ota.confirmation_timeout(),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
host = "mqtt.example.com"
port = 8883
username = "ota"
password_env = "HOMIE_OTA_TEST_UNSET_VAR"
tls_ca_cert = "/etc/ssl/ca.pem"
keep_alive_secs = 30

[mqtt.reconnect]
max_attempts = 2
backoff_ms = [100]
sustained_ms = 500

[device]
base_topic = "home/"
device_id = "garage-door"

[ota]
online_timeout_secs = 10
confirmation_timeout_secs = 0
allow_unrecognized = true
"#;

        let config = UpdaterConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.mqtt.host, "mqtt.example.com");
        assert_eq!(config.mqtt.tls_ca_cert, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert_eq!(config.mqtt.reconnect.max_attempts, Some(2));
        assert_eq!(config.mqtt.reconnect.backoff_ms, vec![100]);
        assert_eq!(config.mqtt.resolve_password(), None);
        assert_eq!(config.device.device_id.as_deref(), Some("garage-door"));
        assert_eq!(config.ota.confirmation_timeout(), None);
        assert!(config.ota.allow_unrecognized);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_topic_is_normalized() {
        let config = UpdaterConfig::test_config();
        assert_eq!(config.device.base_topic, "devices/");
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = UpdaterConfig::test_config();
        config.apply_overrides(ConfigOverrides {
            host: Some("10.0.0.2".to_string()),
            password: Some("secret".to_string()),
            base_topic: Some("other".to_string()),
            online_timeout_secs: Some(5),
            ..Default::default()
        });

        assert_eq!(config.mqtt.host, "10.0.0.2");
        // Untouched values keep the file setting
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.device.device_id.as_deref(), Some("kitchen-light"));
        assert_eq!(config.device.base_topic, "other/");
        assert_eq!(config.mqtt.resolve_password().as_deref(), Some("secret"));
        assert_eq!(config.ota.online_timeout_secs, 5);
        assert!(!config.ota.allow_unrecognized);
    }

    #[test]
    fn test_invalid_device_id() {
        let mut config = UpdaterConfig::default();
        config.device.device_id = Some("Kitchen_Light".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = UpdaterConfig::default();
        config.mqtt.port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_update_target_requires_device_and_firmware() {
        let config = UpdaterConfig::default();
        assert!(matches!(
            config.update_target(),
            Err(ConfigError::Missing(_))
        ));

        let config = UpdaterConfig::test_config();
        let (device_id, firmware) = config.update_target().unwrap();
        assert_eq!(device_id, "kitchen-light");
        assert_eq!(firmware, Path::new("firmware.bin"));
    }

    #[test]
    fn test_redacted_toml_hides_password() {
        let mut config = UpdaterConfig::test_config();
        config.mqtt.password = Some("hunter2".to_string());

        let shown = config.to_redacted_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains(REDACTED));

        // The rendered form loads back
        let reparsed = UpdaterConfig::from_toml(&shown).unwrap();
        assert_eq!(reparsed.device, config.device);
    }

    #[test]
    fn test_unknown_types_are_parse_errors() {
        let result = UpdaterConfig::from_toml("[mqtt]\nport = \"not a number\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
