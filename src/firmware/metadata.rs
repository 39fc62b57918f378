//! Homie firmware metadata extraction
//!
//! Homie for ESP8266 embeds the firmware name, version and brand between
//! fixed magic byte sequences so that tooling can identify an image without
//! running it. This module locates those markers.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Brand reported when the image does not carry a custom brand marker
pub const DEFAULT_BRAND: &str = "unset (default is Homie)";

static HOMIE_MAGIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\x25\x48\x4f\x4d\x49\x45\x5f\x45\x53\x50\x38\x32\x36\x36\x5f\x46\x57\x25")
        .expect("homie magic pattern is valid")
});

static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\xbf\x84\xe4\x13\x54(.+?)\x93\x44\x6b\xa7\x75")
        .expect("name pattern is valid")
});

static VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\x6a\x3f\x3e\x0e\xe1(.+?)\xb0\x30\x48\xd4\x1a")
        .expect("version pattern is valid")
});

static BRAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\xfb\x2a\xf5\x68\xc0(.+?)\x6e\x2f\x0f\xeb\x2d")
        .expect("brand pattern is valid")
});

/// Identification embedded in a Homie firmware image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareMetadata {
    pub name: String,
    pub version: String,
    pub brand: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetadataError {
    #[error("Not a valid Homie firmware")]
    NotRecognized,
}

/// Extract name, version and brand from a firmware image.
///
/// The Homie magic, name and version markers are required. A missing brand
/// marker yields [`DEFAULT_BRAND`].
pub fn extract_metadata(data: &[u8]) -> Result<FirmwareMetadata, MetadataError> {
    if !HOMIE_MAGIC.is_match(data) {
        return Err(MetadataError::NotRecognized);
    }

    let name = capture(&NAME, data).ok_or(MetadataError::NotRecognized)??;
    let version = capture(&VERSION, data).ok_or(MetadataError::NotRecognized)??;
    let brand = match capture(&BRAND, data) {
        Some(brand) => brand?,
        None => DEFAULT_BRAND.to_string(),
    };

    Ok(FirmwareMetadata {
        name,
        version,
        brand,
    })
}

fn capture(pattern: &Regex, data: &[u8]) -> Option<Result<String, MetadataError>> {
    let bytes = pattern.captures(data)?.get(1)?.as_bytes();
    Some(
        String::from_utf8(bytes.to_vec()).map_err(|_| MetadataError::NotRecognized),
    )
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Synthetic firmware images carrying Homie markers

    pub const MAGIC: &[u8] = b"%HOMIE_ESP8266_FW%";
    pub const NAME_START: &[u8] = &[0xbf, 0x84, 0xe4, 0x13, 0x54];
    pub const NAME_END: &[u8] = &[0x93, 0x44, 0x6b, 0xa7, 0x75];
    pub const VERSION_START: &[u8] = &[0x6a, 0x3f, 0x3e, 0x0e, 0xe1];
    pub const VERSION_END: &[u8] = &[0xb0, 0x30, 0x48, 0xd4, 0x1a];
    pub const BRAND_START: &[u8] = &[0xfb, 0x2a, 0xf5, 0x68, 0xc0];
    pub const BRAND_END: &[u8] = &[0x6e, 0x2f, 0x0f, 0xeb, 0x2d];

    pub fn homie_image(name: &str, version: &str, brand: Option<&str>) -> Vec<u8> {
        let mut image = vec![0xe9, 0x03, 0x02, 0x20, 0x00, 0x10];
        image.extend_from_slice(MAGIC);
        image.extend_from_slice(&[0x00; 16]);
        image.extend_from_slice(NAME_START);
        image.extend_from_slice(name.as_bytes());
        image.extend_from_slice(NAME_END);
        image.extend_from_slice(&[0xaa; 8]);
        image.extend_from_slice(VERSION_START);
        image.extend_from_slice(version.as_bytes());
        image.extend_from_slice(VERSION_END);
        if let Some(brand) = brand {
            image.extend_from_slice(BRAND_START);
            image.extend_from_slice(brand.as_bytes());
            image.extend_from_slice(BRAND_END);
        }
        image.extend_from_slice(&[0xff; 32]);
        image
    }
}
