//! Firmware images and their digests

pub mod metadata;

pub use metadata::{extract_metadata, FirmwareMetadata, MetadataError, DEFAULT_BRAND};

use bytes::Bytes;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a firmware image
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Failed to read firmware {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Firmware image is empty")]
    Empty,
}

/// Lowercase hex MD5, the digest Homie publishes on `$fw/checksum`
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// An immutable firmware image with its checksum computed once
#[derive(Debug, Clone, PartialEq)]
pub struct Firmware {
    bytes: Bytes,
    checksum: String,
}

impl Firmware {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, FirmwareError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(FirmwareError::Empty);
        }
        let checksum = md5_hex(&bytes);
        Ok(Self { bytes, checksum })
    }

    pub fn load(path: &Path) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path).map_err(|source| FirmwareError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(data)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn metadata(&self) -> Result<FirmwareMetadata, MetadataError> {
        extract_metadata(&self.bytes)
    }
}
