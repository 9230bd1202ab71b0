//! Core data structures for the PixTools job contract.
//!
//! - Clients submit work via `POST /api/process` (multipart: file + operations)
//! - Status polling returns a [`JobStatusResponse`] with freshly signed URLs
//! - [`JobRecord`] is the persisted representation owned by the ledger
//!
//! # Key concepts
//!
//! - **Job**: one upload plus 1–6 operations; identified by a random UUIDv4
//! - **Operation**: a single unit of work fanned out to a worker
//! - **Result keys**: operation tag → object-store key of the produced artifact

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Requested operation tag.
///
/// `denoise` always produces PNG output; `metadata` produces no image
/// artifact and instead populates the job's metadata field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Jpg,
    Png,
    Webp,
    Avif,
    Denoise,
    Metadata,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Jpg,
        Operation::Png,
        Operation::Webp,
        Operation::Avif,
        Operation::Denoise,
        Operation::Metadata,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Jpg => "jpg",
            Operation::Png => "png",
            Operation::Webp => "webp",
            Operation::Avif => "avif",
            Operation::Denoise => "denoise",
            Operation::Metadata => "metadata",
        }
    }

    /// True for format conversion targets (not denoise/metadata)
    pub fn is_conversion(self) -> bool {
        matches!(
            self,
            Operation::Jpg | Operation::Png | Operation::Webp | Operation::Avif
        )
    }

    /// True for every operation that yields an object-store artifact
    pub fn produces_image(self) -> bool {
        !matches!(self, Operation::Metadata)
    }

    /// File extension of the produced artifact, if any
    pub fn output_ext(self) -> Option<&'static str> {
        match self {
            Operation::Jpg => Some("jpg"),
            Operation::Png => Some("png"),
            Operation::Webp => Some("webp"),
            Operation::Avif => Some("avif"),
            Operation::Denoise => Some("png"),
            Operation::Metadata => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jpg" => Ok(Operation::Jpg),
            "png" => Ok(Operation::Png),
            "webp" => Ok(Operation::Webp),
            "avif" => Ok(Operation::Avif),
            "denoise" => Ok(Operation::Denoise),
            "metadata" => Ok(Operation::Metadata),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation tag: {0}")]
pub struct UnknownOperation(pub String);

/// Per-operation parameters.
///
/// `quality` applies to jpg/webp only; `resize` to every image-producing
/// operation. Unknown parameter names are ignored on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<Resize>,
}

impl OperationParams {
    pub fn is_empty(&self) -> bool {
        self.quality.is_none() && self.resize.is_none()
    }
}

/// Resize dimensions; a single present dimension is aspect-preserving
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    CompletedWebhookFailed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWebhookFailed | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWebhookFailed => "completed_webhook_failed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Persisted job record (see the ledger for ownership rules)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub operations: Vec<Operation>,
    /// Operation tag → object-store key of the produced artifact
    #[serde(default)]
    pub result_keys: BTreeMap<Operation, String>,
    #[serde(default)]
    pub archive_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Key of the uploaded source image (`raw/{job_id}/{name}`)
    pub source_key: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        operations: Vec<Operation>,
        source_key: String,
        webhook_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            operations,
            result_keys: BTreeMap::new(),
            archive_key: None,
            metadata: None,
            webhook_url,
            error: None,
            source_key,
            created_at: now,
            updated_at: now,
            retries: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobAcceptedResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    pub operations: Vec<Operation>,
    pub result_urls: BTreeMap<Operation, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub dependencies: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tags_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("gif".parse::<Operation>().is_err());
    }

    #[test]
    fn denoise_outputs_png() {
        assert_eq!(Operation::Denoise.output_ext(), Some("png"));
        assert!(Operation::Denoise.produces_image());
        assert!(!Operation::Denoise.is_conversion());
    }

    #[test]
    fn metadata_produces_no_artifact() {
        assert_eq!(Operation::Metadata.output_ext(), None);
        assert!(!Operation::Metadata.produces_image());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::CompletedWebhookFailed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn result_keys_serialize_as_string_keyed_map() {
        let mut record = JobRecord::new(
            "job-1".to_string(),
            vec![Operation::Webp],
            "raw/job-1/in.png".to_string(),
            None,
            Utc::now(),
        );
        record
            .result_keys
            .insert(Operation::Webp, "processed/job-1/webp.webp".to_string());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json["result_keys"]["webp"],
            serde_json::json!("processed/job-1/webp.webp")
        );

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.result_keys.len(), 1);
    }

    #[test]
    fn params_ignore_unknown_fields() {
        let params: OperationParams =
            serde_json::from_str(r#"{"quality": 80, "sharpen": true}"#).unwrap();
        assert_eq!(params.quality, Some(80));
        assert!(params.resize.is_none());
    }
}
