//! Typed device messages parsed from the Homie topic tree
//!
//! Parsing is pure: a relative topic and a raw payload go in, a typed
//! [`DeviceMessage`] (or a [`ProtocolError`]) comes out.

use super::topics::{FW_CHECKSUM, FW_NAME, FW_VERSION, OTA_ENABLED, OTA_STATUS, STATE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol violations reported by the device
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Payload on {topic} is not valid UTF-8")]
    InvalidUtf8 { topic: String },
    #[error("Unknown device state: {0}")]
    UnknownState(String),
    #[error("Malformed OTA status: {0}")]
    MalformedStatus(String),
    #[error("Unknown OTA status code: {0}")]
    UnknownStatusCode(u16),
    #[error("Malformed firmware checksum: {0}")]
    MalformedChecksum(String),
}

/// Homie 3.0 device lifecycle (`$state`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Init,
    Ready,
    Disconnected,
    Sleeping,
    Lost,
    Alert,
}

impl DeviceState {
    /// States in which the device will not act on an OTA request
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            DeviceState::Lost | DeviceState::Disconnected | DeviceState::Sleeping
        )
    }
}

impl FromStr for DeviceState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(DeviceState::Init),
            "ready" => Ok(DeviceState::Ready),
            "disconnected" => Ok(DeviceState::Disconnected),
            "sleeping" => Ok(DeviceState::Sleeping),
            "lost" => Ok(DeviceState::Lost),
            "alert" => Ok(DeviceState::Alert),
            other => Err(ProtocolError::UnknownState(other.to_string())),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Init => "init",
            DeviceState::Ready => "ready",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Sleeping => "sleeping",
            DeviceState::Lost => "lost",
            DeviceState::Alert => "alert",
        };
        f.write_str(s)
    }
}

/// HTTP-like status codes published on `$implementation/ota/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// 200: firmware written, device about to reboot
    Ok,
    /// 202: checksum accepted, transfer starting
    Accepted,
    /// 206: transfer in progress
    InProgress,
    /// 304: device already runs this firmware
    NotModified,
    /// 400: bad checksum or image
    BadChecksum,
    /// 403: OTA disabled on the device
    Forbidden,
    /// 500: device failed to write the image
    InternalError,
}

impl StatusCode {
    pub fn from_u16(code: u16) -> Result<Self, ProtocolError> {
        match code {
            200 => Ok(StatusCode::Ok),
            202 => Ok(StatusCode::Accepted),
            206 => Ok(StatusCode::InProgress),
            304 => Ok(StatusCode::NotModified),
            400 => Ok(StatusCode::BadChecksum),
            403 => Ok(StatusCode::Forbidden),
            500 => Ok(StatusCode::InternalError),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Accepted => 202,
            StatusCode::InProgress => 206,
            StatusCode::NotModified => 304,
            StatusCode::BadChecksum => 400,
            StatusCode::Forbidden => 403,
            StatusCode::InternalError => 500,
        }
    }
}

/// Bytes written so far out of the image size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub written: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.written == self.total
    }
}

/// Parsed `"<code>[ <written>/<total>]"` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaStatus {
    pub code: StatusCode,
    pub progress: Option<TransferProgress>,
}

impl OtaStatus {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedStatus(payload.to_string());

        let mut parts = payload.split_whitespace();
        let code = parts
            .next()
            .ok_or_else(malformed)?
            .parse::<u16>()
            .map_err(|_| malformed())?;
        let code = StatusCode::from_u16(code)?;

        let progress = match parts.next() {
            Some(fraction) => {
                let (written, total) = fraction.split_once('/').ok_or_else(malformed)?;
                Some(TransferProgress {
                    written: written.parse().map_err(|_| malformed())?,
                    total: total.parse().map_err(|_| malformed())?,
                })
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(malformed());
        }
        if code == StatusCode::InProgress && progress.is_none() {
            return Err(malformed());
        }

        Ok(Self { code, progress })
    }
}

/// A message from the device, keyed by the topic it arrived on
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    State(DeviceState),
    /// `true` only for the literal payload `"true"`
    OtaEnabled(bool),
    OtaStatus(OtaStatus),
    /// Lowercase hex MD5 of the running firmware
    FirmwareChecksum(String),
    FirmwareName(String),
    FirmwareVersion(String),
}

impl DeviceMessage {
    /// Parse a payload received on `relative_topic`. Returns `Ok(None)` for
    /// topics the updater does not act on.
    pub fn parse(relative_topic: &str, payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8 {
            topic: relative_topic.to_string(),
        })?;

        let message = match relative_topic {
            STATE => DeviceMessage::State(text.parse()?),
            OTA_ENABLED => DeviceMessage::OtaEnabled(text == "true"),
            OTA_STATUS => DeviceMessage::OtaStatus(OtaStatus::parse(text)?),
            FW_CHECKSUM => DeviceMessage::FirmwareChecksum(parse_checksum(text)?),
            FW_NAME => DeviceMessage::FirmwareName(text.to_string()),
            FW_VERSION => DeviceMessage::FirmwareVersion(text.to_string()),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn parse_checksum(text: &str) -> Result<String, ProtocolError> {
    let checksum = text.trim();
    if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtocolError::MalformedChecksum(text.to_string()));
    }
    Ok(checksum.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(
            DeviceMessage::parse("$state", b"ready").unwrap(),
            Some(DeviceMessage::State(DeviceState::Ready))
        );
        assert_eq!(
            DeviceMessage::parse("$state", b"lost").unwrap(),
            Some(DeviceMessage::State(DeviceState::Lost))
        );
        assert!(matches!(
            DeviceMessage::parse("$state", b"true"),
            Err(ProtocolError::UnknownState(_))
        ));
    }

    #[test]
    fn test_parse_ota_enabled() {
        assert_eq!(
            DeviceMessage::parse("$implementation/ota/enabled", b"true").unwrap(),
            Some(DeviceMessage::OtaEnabled(true))
        );
        // Anything but the literal "true" means disabled
        for payload in [&b"false"[..], b"TRUE", b"1", b""] {
            assert_eq!(
                DeviceMessage::parse("$implementation/ota/enabled", payload).unwrap(),
                Some(DeviceMessage::OtaEnabled(false))
            );
        }
    }

    #[test]
    fn test_parse_status_with_progress() {
        let status = OtaStatus::parse("206 50/200").unwrap();
        assert_eq!(status.code, StatusCode::InProgress);
        assert_eq!(
            status.progress,
            Some(TransferProgress {
                written: 50,
                total: 200
            })
        );
    }

    #[test]
    fn test_parse_status_without_progress() {
        let status = OtaStatus::parse("403").unwrap();
        assert_eq!(status.code, StatusCode::Forbidden);
        assert!(status.progress.is_none());
        assert_eq!(OtaStatus::parse("304").unwrap().code, StatusCode::NotModified);
    }

    #[test]
    fn test_parse_status_errors() {
        assert!(matches!(
            OtaStatus::parse("206"),
            Err(ProtocolError::MalformedStatus(_))
        ));
        assert!(matches!(
            OtaStatus::parse("abc 1/2"),
            Err(ProtocolError::MalformedStatus(_))
        ));
        assert!(matches!(
            OtaStatus::parse("206 1-2"),
            Err(ProtocolError::MalformedStatus(_))
        ));
        assert!(matches!(
            OtaStatus::parse(""),
            Err(ProtocolError::MalformedStatus(_))
        ));
        assert_eq!(
            OtaStatus::parse("418"),
            Err(ProtocolError::UnknownStatusCode(418))
        );
    }

    #[test]
    fn test_parse_checksum() {
        assert_eq!(
            DeviceMessage::parse("$fw/checksum", b"ABC123").unwrap(),
            Some(DeviceMessage::FirmwareChecksum("abc123".to_string()))
        );
        assert!(matches!(
            DeviceMessage::parse("$fw/checksum", b"not-hex"),
            Err(ProtocolError::MalformedChecksum(_))
        ));
    }

    #[test]
    fn test_parse_invalid_utf8() {
        assert!(matches!(
            DeviceMessage::parse("$state", &[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn test_unrelated_topic_is_ignored() {
        assert_eq!(DeviceMessage::parse("$fw/brand", b"acme").unwrap(), None);
        assert_eq!(DeviceMessage::parse("light/on", b"true").unwrap(), None);
    }

    #[test]
    fn test_status_code_round_trip_values() {
        for code in [200u16, 202, 206, 304, 400, 403, 500] {
            assert_eq!(StatusCode::from_u16(code).unwrap().as_u16(), code);
        }
    }

    #[test]
    fn test_offline_states() {
        assert!(DeviceState::Lost.is_offline());
        assert!(DeviceState::Disconnected.is_offline());
        assert!(!DeviceState::Init.is_offline());
        assert!(!DeviceState::Ready.is_offline());
        assert!(!DeviceState::Alert.is_offline());
    }
}
