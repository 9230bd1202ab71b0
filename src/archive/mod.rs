//! ZIP bundling of result artifacts
//!
//! Runs as a post-finalize task on the standard queue. Entry names are
//! deterministic (`{operation}.{ext}`, ordered by tag) so the same result
//! set always produces the same layout. Failures leave the job COMPLETED
//! without an archive key.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use thiserror::Error;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::api::models::Operation;
use crate::storage::{StorageClient, StorageError};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("zip write failed: {0}")]
    Zip(String),

    #[error("archive worker panicked")]
    Join,
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        ArchiveError::Zip(err.to_string())
    }
}

/// Deterministic entry name for one artifact
fn entry_name(operation: Operation) -> String {
    let ext = operation.output_ext().unwrap_or("bin");
    format!("{operation}.{ext}")
}

/// Fetch every result artifact, bundle them into a ZIP, upload it to
/// `archives/{job_id}.zip` and return that key.
pub async fn build_and_store(
    storage: &StorageClient,
    job_id: &str,
    result_keys: &BTreeMap<Operation, String>,
) -> Result<String, ArchiveError> {
    let mut entries = Vec::with_capacity(result_keys.len());
    for (operation, key) in result_keys {
        let bytes = storage.get(key).await?;
        entries.push((entry_name(*operation), bytes));
    }

    // zip writes synchronously; keep it off the async executor
    let zipped = tokio::task::spawn_blocking(move || write_zip(entries))
        .await
        .map_err(|_| ArchiveError::Join)??;

    let archive_key = StorageClient::archive_key(job_id);
    storage.put_archive(&archive_key, zipped).await?;
    tracing::info!(job_id, key = %archive_key, "archive stored");
    Ok(archive_key)
}

fn write_zip(entries: Vec<(String, Bytes)>) -> Result<Bytes, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, bytes) in entries {
        writer.start_file(name, options)?;
        writer
            .write_all(&bytes)
            .map_err(|e| ArchiveError::Zip(e.to_string()))?;
    }

    let cursor = writer.finish()?;
    Ok(Bytes::from(cursor.into_inner()))
}
