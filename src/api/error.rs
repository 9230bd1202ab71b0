use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("payload too large: {0}")]
    TooLarge(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SignatureRejected(_) => StatusCode::FORBIDDEN,
            ApiError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Invalid(_) => "INVALID_REQUEST",
            ApiError::UnsupportedMedia(_) => "UNSUPPORTED_MEDIA_TYPE",
            ApiError::TooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::SignatureRejected(_) => "SIGNATURE_REJECTED",
            ApiError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        // A body that blew through the request-level limit surfaces here as
        // a multipart read error; keep the 413 contract for it
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::TooLarge("request body exceeds the configured limit".to_string());
        }
        ApiError::Invalid(format!("multipart body: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_contract() {
        assert_eq!(
            ApiError::Invalid("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::UnsupportedMedia("x".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiError::TooLarge("11 > 10".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Upstream("s3".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::NotFound("job".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
