//! Terminal outcomes of an update session and their process exit codes

use crate::protocol::{DeviceState, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code for `Succeeded` and `UpToDate`
pub const EXIT_OK: i32 = 0;
/// Exit code for input and configuration errors (no session was created)
pub const EXIT_INPUT_ERROR: i32 = 1;
/// Exit code for `Aborted`
pub const EXIT_ABORTED: i32 = 2;
/// Exit code for `Failed`
pub const EXIT_FAILED: i32 = 3;

/// Why a session stopped before any firmware was pushed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// Broker unreachable or connection refused
    ConnectionFailed(String),
    /// Connection dropped and could not be re-established
    ConnectionLost(String),
    /// Device reported a lifecycle state in which it cannot be updated
    DeviceUnavailable(DeviceState),
    OtaDisabled,
    /// Device did not reach `ready` within the online timeout
    OnlineTimeout,
    /// Device came online but did not report OTA info within the timeout
    DeviceInfoTimeout,
    ProtocolError(String),
    Interrupted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::ConnectionFailed(reason) => {
                write!(f, "MQTT connection failed: {reason}")
            }
            AbortReason::ConnectionLost(reason) => write!(f, "MQTT connection lost: {reason}"),
            AbortReason::DeviceUnavailable(DeviceState::Alert) => {
                write!(f, "Device is in alert state")
            }
            AbortReason::DeviceUnavailable(state) => write!(f, "Device is offline ({state})"),
            AbortReason::OtaDisabled => write!(f, "Device OTA disabled"),
            AbortReason::OnlineTimeout => write!(f, "Device did not come online"),
            AbortReason::DeviceInfoTimeout => write!(f, "Device did not report OTA status"),
            AbortReason::ProtocolError(reason) => write!(f, "Protocol error: {reason}"),
            AbortReason::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// Why a session failed after the firmware was pushed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Device answered 403 to the pushed image
    Forbidden,
    /// Device answered 304 after the push; treated as an anomaly
    UnexpectedNotModified,
    /// Device answered 400 or 500
    DeviceRejected(u16),
    /// Device came back with a different firmware than the one pushed
    ChecksumMismatch { expected: String, actual: String },
    PublishFailed(String),
    ConnectionLost(String),
    /// Device did not confirm the new firmware in time
    ConfirmationTimeout,
    ProtocolError(String),
    Interrupted,
}

impl FailureReason {
    pub fn device_rejected(code: StatusCode) -> Self {
        FailureReason::DeviceRejected(code.as_u16())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Forbidden => write!(f, "Device OTA disabled (403)"),
            FailureReason::UnexpectedNotModified => {
                write!(f, "Device reported 304 (not modified) after the firmware was pushed")
            }
            FailureReason::DeviceRejected(code) => {
                write!(f, "Device rejected the firmware with status {code}")
            }
            FailureReason::ChecksumMismatch { expected, actual } => {
                write!(f, "Expecting checksum {expected}, got {actual}")
            }
            FailureReason::PublishFailed(reason) => write!(f, "Publishing failed: {reason}"),
            FailureReason::ConnectionLost(reason) => {
                write!(f, "MQTT connection lost while awaiting confirmation: {reason}")
            }
            FailureReason::ConfirmationTimeout => {
                write!(f, "Device did not confirm the new firmware in time")
            }
            FailureReason::ProtocolError(reason) => write!(f, "Protocol error: {reason}"),
            FailureReason::Interrupted => write!(f, "Interrupted while awaiting confirmation"),
        }
    }
}

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    UpToDate,
    Aborted(AbortReason),
    Succeeded,
    Failed(FailureReason),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::UpToDate | Outcome::Succeeded => EXIT_OK,
            Outcome::Aborted(_) => EXIT_ABORTED,
            Outcome::Failed(_) => EXIT_FAILED,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == EXIT_OK
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::UpToDate => write!(f, "up to date"),
            Outcome::Aborted(reason) => write!(f, "aborted: {reason}"),
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
