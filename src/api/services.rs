use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::models::{HealthResponse, JobAcceptedResponse, JobRecord, JobStatusResponse};
use super::state::AppState;
use super::{utils, validation};
use crate::plan::build_plan;
use crate::processing::sniff_format;
use crate::storage::{StorageClient, with_retries};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const UPLOAD_RETRIES: u32 = 3;
const UPLOAD_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Collected multipart submission fields
struct Submission {
    file: Bytes,
    filename: Option<String>,
    operations_raw: String,
    params_raw: Option<String>,
    webhook_url: Option<String>,
}

/// Job submission endpoint (POST /api/process)
///
/// Flow:
/// 1. Collect multipart fields; enforce the upload size boundary (413)
/// 2. Sniff the source format from magic bytes (415 on failure)
/// 3. Validate operations / params / webhook url (422)
/// 4. Idempotency check: a hit returns the existing job with no new work
/// 5. Upload raw bytes (brief retry on transient failure, 503 on exhaustion)
/// 6. Create the job record (PENDING), dispatch the plan, mark PROCESSING
/// 7. Store the idempotency mapping (fail-open) and return 202
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let submission = collect_submission(multipart, state.config.limits.max_upload_bytes.as_u64())
        .await?;

    // The bytes decide the source format; declared types were only sanity
    // checked during collection
    let source_format = sniff_format(&submission.file).ok_or_else(|| {
        ApiError::UnsupportedMedia("file is not a recognized jpg/png/webp/avif image".to_string())
    })?;

    let operations = validation::parse_operations(&submission.operations_raw)
        .map_err(|e| ApiError::Invalid(e.to_string()))?;
    validation::reject_same_format(&operations, source_format)
        .map_err(|e| ApiError::Invalid(e.to_string()))?;
    let params = validation::parse_params(submission.params_raw.as_deref(), &operations)
        .map_err(|e| ApiError::Invalid(e.to_string()))?;

    if let Some(url) = &submission.webhook_url {
        validation::validate_webhook_url(url).map_err(|e| ApiError::Invalid(e.to_string()))?;
    }

    let idempotency_key = extract_idempotency_key(&headers, &state)?;

    // Idempotency check: a hit performs no new work and re-uploads nothing.
    // Lookup errors are a cache miss (fail-open).
    if let Some(key) = &idempotency_key {
        match state
            .store
            .check_idempotent(key, state.config.retention.idempotency_ttl())
        {
            Ok(Some(existing_job_id)) => {
                info!(job_id = %existing_job_id, "idempotent replay, returning existing job");
                return Ok((
                    StatusCode::ACCEPTED,
                    Json(JobAcceptedResponse {
                        job_id: existing_job_id,
                    }),
                ));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "idempotency lookup failed, treating as miss"),
        }
    }

    let job_id = Uuid::new_v4().to_string();
    let correlation_id = Uuid::new_v4().to_string();
    let filename = utils::sanitize_filename(submission.filename.as_deref(), source_format);
    let source_key = StorageClient::raw_key(&job_id, &filename);

    // Raw upload with a brief retry budget; no job record exists on failure
    with_retries(UPLOAD_RETRIES, UPLOAD_RETRY_BACKOFF, || {
        let file = submission.file.clone();
        let source_key = source_key.clone();
        let storage = state.storage.clone();
        async move { storage.put_raw(&source_key, file).await }
    })
    .await
    .map_err(|e| {
        if e.is_transient() {
            ApiError::Upstream(format!("object store: {e}"))
        } else {
            ApiError::Internal(format!("object store: {e}"))
        }
    })?;

    let record = JobRecord::new(
        job_id.clone(),
        operations.clone(),
        source_key.clone(),
        submission.webhook_url.clone(),
        Utc::now(),
    );
    state
        .store
        .create(&record)
        .map_err(|e| ApiError::Internal(format!("job store: {e}")))?;

    let plan = build_plan(&job_id, &source_key, &operations, &params, &correlation_id);
    state
        .broker
        .dispatch(&plan)
        .await
        .map_err(|e| ApiError::Upstream(format!("broker: {e}")))?;

    state
        .store
        .mark_processing(&job_id)
        .map_err(|e| ApiError::Internal(format!("job store: {e}")))?;

    // Fail-open: a lost mapping costs at most a duplicate job on retry
    if let Some(key) = &idempotency_key {
        if let Err(e) = state.store.set_idempotent_if_absent(key, &job_id) {
            warn!(error = %e, "failed to store idempotency mapping");
        }
    }

    state.metrics.job_accepted();
    for _ in plan.tasks() {
        state.metrics.task_dispatched();
    }
    info!(
        job_id = %job_id,
        correlation_id = %correlation_id,
        operations = operations.len(),
        "job accepted"
    );

    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse { job_id })))
}

async fn collect_submission(
    mut multipart: Multipart,
    max_upload_bytes: u64,
) -> Result<Submission, ApiError> {
    let mut file = None;
    let mut filename = None;
    let mut operations_raw = None;
    let mut params_raw = None;
    let mut webhook_url = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                utils::check_declared_content_type(field.content_type())?;
                filename = field.file_name().map(str::to_owned);
                let bytes = field.bytes().await?;
                utils::check_upload_size(bytes.len(), max_upload_bytes)?;
                file = Some(bytes);
            }
            Some("operations") => operations_raw = Some(field.text().await?),
            Some("operation_params") => params_raw = Some(field.text().await?),
            Some("webhook_url") => webhook_url = Some(field.text().await?),
            _ => {
                // Unknown parts are drained and ignored
                let _ = field.bytes().await?;
            }
        }
    }

    let file = file.ok_or_else(|| ApiError::Invalid("missing required field: file".to_string()))?;
    let operations_raw = operations_raw
        .ok_or_else(|| ApiError::Invalid("missing required field: operations".to_string()))?;

    Ok(Submission {
        file,
        filename,
        operations_raw,
        params_raw,
        webhook_url: webhook_url.filter(|u| !u.is_empty()),
    })
}

fn extract_idempotency_key(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| ApiError::Invalid("idempotency key must be visible ASCII".to_string()))?
        .to_string();
    if key.is_empty() {
        return Ok(None);
    }
    validation::validate_idempotency_key(&key, state.config.limits.idempotency_key_max_bytes)
        .map_err(|e| ApiError::Invalid(e.to_string()))?;
    Ok(Some(key))
}

/// Job status endpoint (GET /api/jobs/{job_id})
///
/// Returns the current state with freshly signed URLs. No side effects.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .store
        .load(&job_id)
        .map_err(|e| ApiError::Internal(format!("job store: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    let mut result_urls = BTreeMap::new();
    for (operation, key) in &record.result_keys {
        match state.storage.sign(key).await {
            Ok(url) => {
                result_urls.insert(*operation, url);
            }
            Err(e) => warn!(job_id = %job_id, key, error = %e, "could not sign result url"),
        }
    }

    let archive_url = match &record.archive_key {
        Some(key) => state.storage.sign(key).await.ok(),
        None => None,
    };

    Ok((
        StatusCode::OK,
        Json(JobStatusResponse {
            status: record.status,
            operations: record.operations,
            result_urls,
            archive_url,
            metadata: record.metadata,
            error: record.error,
            created_at: record.created_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub expires: i64,
    pub sig: String,
}

/// Signed artifact download (GET /api/artifacts/{key})
///
/// Serves the bytes behind a signed URL after verifying the signature and
/// expiry. Forged or expired signatures → 403; missing objects → 404.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .storage
        .signer()
        .verify(&key, query.expires, &query.sig, Utc::now())
        .map_err(|e| ApiError::SignatureRejected(e.to_string()))?;

    let bytes = state.storage.get(&key).await.map_err(|e| match e {
        crate::storage::StorageError::NotFound(_) => ApiError::NotFound(key.clone()),
        other => ApiError::Internal(other.to_string()),
    })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, utils::content_type_for_key(&key))],
        bytes,
    ))
}

/// Health endpoint (GET /api/health)
///
/// Reports each dependency as ok/down; 200 iff all are ok.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut dependencies = BTreeMap::new();

    let ledger_ok = state.store.health_check();
    dependencies.insert("database".to_string(), up_down(ledger_ok));
    dependencies.insert("cache".to_string(), up_down(ledger_ok));
    dependencies.insert("broker".to_string(), up_down(state.broker.health_check()));
    dependencies.insert("objectstore".to_string(), up_down(state.storage.health().await));

    let all_ok = dependencies.values().all(|status| status == "ok");
    let (status_code, status) = if all_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            dependencies,
        }),
    )
}

fn up_down(ok: bool) -> String {
    if ok { "ok" } else { "down" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::Operation;
    use crate::processing::ImageFormat;

    #[test]
    fn sniffed_format_drives_same_format_rejection() {
        let png = crate::processing::test_fixtures::png_bytes();
        let format = sniff_format(&png).unwrap();
        assert_eq!(format, ImageFormat::Png);

        let ops = vec![Operation::Png];
        assert!(validation::reject_same_format(&ops, format).is_err());
    }

    #[test]
    fn params_not_required() {
        let ops = vec![Operation::Webp];
        assert!(validation::parse_params(None, &ops).unwrap().is_empty());
    }
}
