//! Image-engine boundary
//!
//! The actual processing primitives (codec conversion, DnCNN inference, EXIF
//! parsing) live outside this crate. [`ImageEngine`] is the seam workers call
//! through; deployments bind a real engine, tests inject failing ones, and
//! [`passthrough::PassthroughEngine`] is the built-in stand-in.

pub mod passthrough;

pub use passthrough::PassthroughEngine;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::api::models::{Operation, OperationParams};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Worth retrying (resource pressure, model warm-up, transient I/O)
    #[error("transient engine failure: {0}")]
    Transient(String),

    /// Retrying cannot help (corrupt input, unsupported combination)
    #[error("engine failure: {0}")]
    Permanent(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// Processing seam between the orchestration engine and the image primitives
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Convert `input` to the container `target` names; `target` is always a
    /// conversion tag (jpg/png/webp/avif)
    async fn convert(
        &self,
        input: Bytes,
        source: ImageFormat,
        target: Operation,
        params: &OperationParams,
    ) -> Result<Bytes, EngineError>;

    /// ML denoise; output is always PNG
    async fn denoise(&self, input: Bytes) -> Result<Bytes, EngineError>;

    /// Extract free-form key/value metadata (EXIF and friends)
    async fn extract_metadata(&self, input: Bytes)
    -> Result<BTreeMap<String, String>, EngineError>;
}

/// Source container formats accepted at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpg,
    Png,
    Webp,
    Avif,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
        }
    }

    /// The conversion tag that would re-encode into this same container
    pub fn conversion_tag(self) -> Operation {
        match self {
            ImageFormat::Jpg => Operation::Jpg,
            ImageFormat::Png => Operation::Png,
            ImageFormat::Webp => Operation::Webp,
            ImageFormat::Avif => Operation::Avif,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sniff the container format from magic bytes.
///
/// Declared content types are advisory; the bytes decide.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageFormat::Png);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpg);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageFormat::Webp);
    }
    if bytes.len() >= 12
        && &bytes[4..8] == b"ftyp"
        && (&bytes[8..12] == b"avif" || &bytes[8..12] == b"avis")
    {
        return Some(ImageFormat::Avif);
    }
    None
}

#[cfg(test)]
pub mod test_fixtures {
    /// Minimal valid-prefix byte blobs for each accepted container
    pub fn png_bytes() -> Vec<u8> {
        let mut b = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        b.extend_from_slice(&[0x00; 64]);
        b
    }

    pub fn jpg_bytes() -> Vec<u8> {
        let mut b = vec![0xFF, 0xD8, 0xFF, 0xE0];
        b.extend_from_slice(&[0x00; 64]);
        b
    }

    pub fn webp_bytes() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(b"RIFF");
        b.extend_from_slice(&64u32.to_le_bytes());
        b.extend_from_slice(b"WEBP");
        b.extend_from_slice(&[0x00; 64]);
        b
    }

    pub fn avif_bytes() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&24u32.to_be_bytes());
        b.extend_from_slice(b"ftypavif");
        b.extend_from_slice(&[0x00; 64]);
        b
    }
}
