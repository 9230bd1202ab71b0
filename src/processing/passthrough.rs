//! Stand-in engine used when no codec binding is installed.
//!
//! Conversion and denoise return the input container unchanged; metadata
//! extraction reports the facts sniffable from the bytes themselves. Real
//! deployments replace this with a binding to the processing sidecar.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use super::{EngineError, ImageEngine, ImageFormat, sniff_format};
use crate::api::models::{Operation, OperationParams};

#[derive(Debug, Clone, Default)]
pub struct PassthroughEngine;

impl PassthroughEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageEngine for PassthroughEngine {
    async fn convert(
        &self,
        input: Bytes,
        _source: ImageFormat,
        target: Operation,
        _params: &OperationParams,
    ) -> Result<Bytes, EngineError> {
        if !target.is_conversion() {
            return Err(EngineError::Permanent(format!(
                "not a conversion target: {target}"
            )));
        }
        Ok(input)
    }

    async fn denoise(&self, input: Bytes) -> Result<Bytes, EngineError> {
        Ok(input)
    }

    async fn extract_metadata(
        &self,
        input: Bytes,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        let format = sniff_format(&input)
            .ok_or_else(|| EngineError::Permanent("unrecognized container".to_string()))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("format".to_string(), format.as_str().to_string());
        metadata.insert("mime".to_string(), format.mime().to_string());
        metadata.insert("bytes".to_string(), input.len().to_string());
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::test_fixtures::png_bytes;

    #[tokio::test]
    async fn convert_passes_bytes_through() {
        let engine = PassthroughEngine::new();
        let input = Bytes::from(png_bytes());
        let out = engine
            .convert(
                input.clone(),
                ImageFormat::Png,
                Operation::Webp,
                &OperationParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn convert_rejects_non_conversion_target() {
        let engine = PassthroughEngine::new();
        let err = engine
            .convert(
                Bytes::from(png_bytes()),
                ImageFormat::Png,
                Operation::Metadata,
                &OperationParams::default(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn metadata_reports_sniffed_facts() {
        let engine = PassthroughEngine::new();
        let meta = engine
            .extract_metadata(Bytes::from(png_bytes()))
            .await
            .unwrap();
        assert_eq!(meta.get("format").map(String::as_str), Some("png"));
        assert_eq!(meta.get("mime").map(String::as_str), Some("image/png"));
        assert!(meta.contains_key("bytes"));
    }

    #[tokio::test]
    async fn metadata_fails_on_garbage() {
        let engine = PassthroughEngine::new();
        assert!(
            engine
                .extract_metadata(Bytes::from_static(b"not an image"))
                .await
                .is_err()
        );
    }
}
