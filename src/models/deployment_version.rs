//! Represents the release pointer for one (deployment, app version) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Mutable pointer binding a (deployment, app version) pair to its
/// current package.
///
/// Created lazily on the first release attempt for the pair and never
/// deleted. `current_package_id` stays empty until a release has been
/// registered.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub id: i64,
    pub deployment_id: i64,
    pub app_version: String,
    pub is_mandatory: bool,
    pub current_package_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    /// The current package id, treating zero the same as unset.
    pub fn current_package(&self) -> Option<i64> {
        self.current_package_id.filter(|id| *id > 0)
    }
}
