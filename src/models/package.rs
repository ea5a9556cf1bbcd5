//! Represents a registered release and the request that produces one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Release method recorded for packages that came in through upload.
pub const RELEASE_METHOD_UPLOAD: &str = "Upload";

/// An immutable release record.
///
/// `package_hash` is the manifest hash (content identity of the release);
/// `blob_url` and `manifest_blob_url` are the blob store keys of the raw
/// archive and of the serialized manifest. `activated_at` records when a
/// deployment version was first pointed at the package; a package that
/// never got there is an orphan.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: i64,
    pub deployment_id: i64,
    pub app_version: String,
    pub description: String,
    pub package_hash: String,
    pub blob_url: String,
    pub manifest_blob_url: String,
    pub size: i64,
    pub label: String,
    pub is_mandatory: bool,
    pub release_method: String,
    pub released_by: String,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Fields needed to insert a new package row.
#[derive(Clone, Debug)]
pub struct NewPackage {
    pub deployment_id: i64,
    pub app_version: String,
    pub description: String,
    pub package_hash: String,
    pub blob_url: String,
    pub manifest_blob_url: String,
    pub size: i64,
    pub label: String,
    pub is_mandatory: bool,
    pub released_by: String,
}

/// Release metadata supplied alongside an uploaded archive.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub app_version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_mandatory: bool,
}

/// Format a label number the way clients expect it.
pub fn format_label(label_id: i64) -> String {
    format!("v{}", label_id)
}
