//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! reconnection backoff and broker option construction.

use crate::config::{MqttSection, ReconnectSection};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - no connection attempted yet
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Disconnected with reason
    Disconnected(String),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 2000,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_ms,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Calculate backoff delay for given attempt using the pattern, then
    /// sustain at `sustained_delay`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Failed to read TLS CA certificate {path}: {source}")]
    TlsCaUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Payload of {size} bytes exceeds max packet size of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Build a unique client ID so parallel runs do not kick each other off the broker
pub fn build_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

/// Pure function to configure MQTT options from config
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);

    // Credentials only when both halves are known
    if let (Some(username), Some(password)) = (&config.username, config.resolve_password()) {
        mqtt_options.set_credentials(username.clone(), password);
    }

    if let Some(ca_path) = &config.tls_ca_cert {
        let ca = std::fs::read(ca_path).map_err(|source| MqttError::TlsCaUnreadable {
            path: ca_path.display().to_string(),
            source,
        })?;
        mqtt_options.set_transport(RumqttcTransport::tls_with_config(
            TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            },
        ));
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_session(true);

    // Firmware images are far larger than the rumqttc default packet limit
    mqtt_options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    Ok(mqtt_options)
}

/// Size of an MQTT PUBLISH packet body for a QoS 0 message
pub fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    // 2-byte topic length prefix, no packet identifier at QoS 0
    2 + topic.len() + payload_len
}

/// Reject a publish whose packet would exceed `max_packet_size`
pub fn ensure_publish_fits(
    topic: &str,
    payload_len: usize,
    max_packet_size: usize,
) -> Result<(), MqttError> {
    let size = publish_packet_size(topic, payload_len);
    if size > max_packet_size {
        return Err(MqttError::PayloadTooLarge {
            size,
            max: max_packet_size,
        });
    }
    Ok(())
}
