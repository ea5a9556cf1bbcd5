use crate::services::error::{ExtractionError, ReleaseError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ReleaseError> for AppError {
    fn from(err: ReleaseError) -> Self {
        let status = match &err {
            ReleaseError::UploadMalformed(_)
            | ReleaseError::EmptyPackage
            | ReleaseError::ExtractionFailed(
                ExtractionError::PathTraversalRejected(_)
                | ExtractionError::SymlinkRejected(_)
                | ExtractionError::EntryConflict(_)
                | ExtractionError::Archive(_),
            ) => StatusCode::BAD_REQUEST,
            ReleaseError::UnsupportedFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ReleaseError::DuplicateRelease { .. } => StatusCode::CONFLICT,
            ReleaseError::DeploymentNotFound(_) | ReleaseError::PackageNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if err.is_user_error() {
            tracing::info!("release rejected: {}", err);
        } else {
            tracing::error!("release failed: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}
