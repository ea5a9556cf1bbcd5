//! Error taxonomy for the release pipeline.

use std::{io, path::PathBuf};
use thiserror::Error;

/// Why extracting an uploaded archive failed.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("archive entry `{0}` escapes the extraction root")]
    PathTraversalRejected(String),
    #[error("archive entry `{0}` is a symbolic link")]
    SymlinkRejected(String),
    #[error("archive entry `{0}` collides with another entry of the same path")]
    EntryConflict(String),
    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("extraction i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("malformed upload: {0}")]
    UploadMalformed(String),
    #[error("unsupported file type `{0}`, expected a zip archive")]
    UnsupportedFileType(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(#[from] ExtractionError),
    #[error("the uploaded package contains no files")]
    EmptyPackage,
    #[error("failed to hash `{}`: {source}", path.display())]
    HashComputationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "the uploaded package is identical to the current release of deployment {deployment_id} for app version `{app_version}`"
    )]
    DuplicateRelease {
        deployment_id: i64,
        app_version: String,
    },
    #[error("deployment {0} not found")]
    DeploymentNotFound(i64),
    #[error("package `{label}` not found in deployment {deployment_id}")]
    PackageNotFound { deployment_id: i64, label: String },
    #[error("failed to upload blob `{key}`: {source}")]
    BlobUploadFailed {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error(
        "package {package_id} was created but deployment {deployment_id} app version `{app_version}` was not advanced: {reason}"
    )]
    PointerUpdateFailed {
        package_id: i64,
        deployment_id: i64,
        app_version: String,
        reason: String,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ReleaseError {
    /// Expected, user-actionable outcomes as opposed to system failures.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ReleaseError::UploadMalformed(_)
                | ReleaseError::UnsupportedFileType(_)
                | ReleaseError::ExtractionFailed(
                    ExtractionError::PathTraversalRejected(_)
                        | ExtractionError::SymlinkRejected(_)
                        | ExtractionError::EntryConflict(_)
                        | ExtractionError::Archive(_)
                )
                | ReleaseError::EmptyPackage
                | ReleaseError::DuplicateRelease { .. }
                | ReleaseError::DeploymentNotFound(_)
                | ReleaseError::PackageNotFound { .. }
        )
    }
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_message_names_the_pair() {
        let err = ReleaseError::DuplicateRelease {
            deployment_id: 4,
            app_version: "1.0".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("deployment 4"));
        assert!(msg.contains("`1.0`"));
        assert!(err.is_user_error());
    }

    #[test]
    fn pointer_failures_are_not_user_errors() {
        let err = ReleaseError::PointerUpdateFailed {
            package_id: 9,
            deployment_id: 1,
            app_version: "1.0".into(),
            reason: "lost race".into(),
        };
        assert!(!err.is_user_error());
        assert!(!ReleaseError::Io(io::Error::other("disk")).is_user_error());
    }
}
