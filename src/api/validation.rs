//! Submission validation: operation lists, per-operation parameters,
//! webhook URLs, idempotency keys.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use super::models::{Operation, OperationParams};
use crate::processing::ImageFormat;

pub const MAX_OPERATIONS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("operations must be a JSON array of tags: {0}")]
    MalformedOperations(String),

    #[error("operations must contain at least one tag")]
    EmptyOperations,

    #[error("operations must contain at most {MAX_OPERATIONS} tags, got {0}")]
    TooManyOperations(usize),

    #[error("unknown operation tag: {0}")]
    UnknownTag(String),

    #[error("conversion to the source format ({0}) is not allowed")]
    SameFormatConversion(&'static str),

    #[error("operation_params must be a JSON object keyed by tag: {0}")]
    MalformedParams(String),

    #[error("quality must be between 1 and 100, got {0}")]
    QualityOutOfRange(u8),

    #[error("resize dimensions must be positive")]
    InvalidResize,

    #[error("webhook_url is not a valid http(s) url: {0}")]
    WebhookUrl(String),

    #[error("idempotency key exceeds {max} bytes ({got})")]
    IdempotencyKeyTooLong { got: usize, max: usize },
}

/// Parse and normalize the `operations` field: JSON array of tags, duplicates
/// collapsed preserving first-seen order, 1–6 entries after normalization.
pub fn parse_operations(raw: &str) -> Result<Vec<Operation>, ValidationError> {
    let tags: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| ValidationError::MalformedOperations(e.to_string()))?;

    let mut seen = BTreeSet::new();
    let mut operations = Vec::new();
    for tag in &tags {
        let operation: Operation = tag
            .parse()
            .map_err(|_| ValidationError::UnknownTag(tag.clone()))?;
        if seen.insert(operation) {
            operations.push(operation);
        }
    }

    if operations.is_empty() {
        return Err(ValidationError::EmptyOperations);
    }
    if operations.len() > MAX_OPERATIONS {
        return Err(ValidationError::TooManyOperations(operations.len()));
    }
    Ok(operations)
}

/// Reject conversion to the inferred source format. Denoise and metadata are
/// exempt: they transform rather than re-encode.
pub fn reject_same_format(
    operations: &[Operation],
    source: ImageFormat,
) -> Result<(), ValidationError> {
    if operations.contains(&source.conversion_tag()) {
        return Err(ValidationError::SameFormatConversion(source.as_str()));
    }
    Ok(())
}

/// Parse `operation_params`. Parameters for operations they do not apply to
/// (and parameters for unrequested operations) are dropped silently; values
/// that are present must be in range.
pub fn parse_params(
    raw: Option<&str>,
    operations: &[Operation],
) -> Result<BTreeMap<Operation, OperationParams>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };

    let by_tag: BTreeMap<String, OperationParams> = serde_json::from_str(raw)
        .map_err(|e| ValidationError::MalformedParams(e.to_string()))?;

    let requested: BTreeSet<Operation> = operations.iter().copied().collect();
    let mut params = BTreeMap::new();

    for (tag, mut p) in by_tag {
        let Ok(operation) = tag.parse::<Operation>() else {
            continue;
        };
        if !requested.contains(&operation) {
            continue;
        }

        if let Some(quality) = p.quality {
            if !(1..=100).contains(&quality) {
                return Err(ValidationError::QualityOutOfRange(quality));
            }
            // Quality applies to jpg/webp only
            if !matches!(operation, Operation::Jpg | Operation::Webp) {
                p.quality = None;
            }
        }

        if let Some(resize) = p.resize {
            if resize.width == Some(0) || resize.height == Some(0) {
                return Err(ValidationError::InvalidResize);
            }
            if resize.width.is_none() && resize.height.is_none() {
                p.resize = None;
            }
        }

        if !p.is_empty() {
            params.insert(operation, p);
        }
    }

    Ok(params)
}

pub fn validate_webhook_url(raw: &str) -> Result<(), ValidationError> {
    crate::webhook::validate_webhook_url(raw)
        .map_err(|e| ValidationError::WebhookUrl(e))
}

pub fn validate_idempotency_key(key: &str, max: usize) -> Result<(), ValidationError> {
    if key.len() > max {
        return Err(ValidationError::IdempotencyKeyTooLong {
            got: key.len(),
            max,
        });
    }
    Ok(())
}
