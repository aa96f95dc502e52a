use axum::Json;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::NaiveDateTime;
use rand::Rng;
use snapwall_common::ErrorResponse;
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::store::StorageError;

pub const MAX_COMMENT_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No file selected")]
    MissingFile,
    #[error("No file selected")]
    EmptyFilename,
    #[error("Comment too long (max 100 characters)")]
    CommentTooLong,
    #[error("Invalid file type")]
    InvalidType,
    #[error("Malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Failed to store upload")]
    Storage(#[from] StorageError),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingFile | Self::EmptyFilename | Self::CommentTooLong | Self::InvalidType => {
                StatusCode::BAD_REQUEST
            }
            Self::Multipart(e) => e.status(),
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        match &self {
            Self::Storage(e) => tracing::error!("upload failed: {}", e),
            Self::Multipart(e) => tracing::info!("rejected upload: {}", e),
            _ => tracing::info!("rejected upload: {}", self),
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

/// A validated upload, ready to be written.
#[derive(Debug)]
pub struct Upload {
    pub stored_name: String,
    pub comment: String,
    pub data: Bytes,
}

impl Upload {
    /// Applies the form rules in order: file present, filename non-empty,
    /// comment length, extension. Nothing touches the disk here.
    pub fn validate(
        file: Option<(String, Bytes)>,
        comment: Option<String>,
        config: &Config,
        now: NaiveDateTime,
    ) -> Result<Self, UploadError> {
        let (original_name, data) = file.ok_or(UploadError::MissingFile)?;
        if original_name.is_empty() {
            return Err(UploadError::EmptyFilename);
        }

        let comment = comment.unwrap_or_default().trim().to_string();
        if comment.chars().count() > MAX_COMMENT_CHARS {
            return Err(UploadError::CommentTooLong);
        }

        let ext = extension(&original_name)
            .filter(|ext| config.allows_extension(ext))
            .ok_or(UploadError::InvalidType)?;

        Ok(Self {
            stored_name: stored_name(&original_name, &ext, now, &random_suffix()),
            comment,
            data,
        })
    }
}

fn extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 4] = rng.r#gen();
    hex::encode(bytes)
}

/// `<timestamp>_<suffix>_<sanitized name>`, always ending in `.<ext>`.
fn stored_name(original: &str, ext: &str, now: NaiveDateTime, suffix: &str) -> String {
    let timestamp = now.format("%Y-%m-%dT%H-%M-%S-%6f");
    let mut safe = secure_filename(original);
    if safe.is_empty() {
        safe = "upload".to_string();
    }
    if !safe.to_ascii_lowercase().ends_with(&format!(".{ext}")) {
        safe = format!("{safe}.{ext}");
    }
    format!("{timestamp}_{suffix}_{safe}")
}

/// Reduces a client-supplied name to `[A-Za-z0-9._-]`, with path separators
/// and whitespace collapsed to `_`. Accented letters keep their base letter
/// (NFKD, then combining marks dropped). Never yields a path.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '.' | '_' | '-'))
        .collect();
    kept.trim_matches(|c: char| c == '.' || c == '_').to_string()
}
