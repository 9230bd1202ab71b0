//! Pure helpers for HTTP request processing

use crate::api::error::ApiError;
use crate::processing::ImageFormat;

/// Validate the declared content type of the uploaded file part, when one is
/// present. The magic bytes remain authoritative; this only rejects parts
/// that declare a non-image type outright.
pub fn check_declared_content_type(declared: Option<&str>) -> Result<(), ApiError> {
    let Some(declared) = declared else {
        return Ok(());
    };

    let media_type: mime::Mime = declared.parse().map_err(|_| {
        ApiError::UnsupportedMedia(format!("unparseable content type: {declared}"))
    })?;

    if media_type.type_() != mime::IMAGE && media_type != mime::APPLICATION_OCTET_STREAM {
        return Err(ApiError::UnsupportedMedia(format!(
            "file part declared {media_type}, expected an image type"
        )));
    }
    Ok(())
}

/// Enforce the upload size boundary: exactly at the limit is accepted, one
/// byte more is rejected.
pub fn check_upload_size(size: usize, max: u64) -> Result<(), ApiError> {
    if size as u64 > max {
        return Err(ApiError::TooLarge(format!("{size} bytes (limit {max})")));
    }
    Ok(())
}

/// Reduce a client-supplied filename to a safe single path segment; falls
/// back to a format-derived name when nothing usable remains.
pub fn sanitize_filename(name: Option<&str>, format: ImageFormat) -> String {
    let candidate = name
        .map(|n| {
            n.rsplit(['/', '\\'])
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        })
        .unwrap_or_default();

    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return format!("input.{}", format.as_str());
    }
    candidate
}

/// Content type served back for a stored artifact, keyed by extension
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
