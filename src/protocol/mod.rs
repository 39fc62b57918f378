//! Homie 3.0 device protocol: topic layout and message parsing

pub mod messages;
pub mod topics;

pub use messages::{
    DeviceMessage, DeviceState, OtaStatus, ProtocolError, StatusCode, TransferProgress,
};
pub use topics::{normalize_base_topic, validate_device_id, DeviceTopics, ValidationError};
