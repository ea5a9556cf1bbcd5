//! Represents a deployment, the namespace releases are published into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A deployment channel (e.g. "Staging", "Production").
///
/// Besides identifying the channel it owns the monotonic label counter
/// used to name packages `v1`, `v2`, ...
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: i64,

    /// Unique human readable name.
    pub name: String,

    /// Last label number handed out. Only ever incremented.
    pub label_id: i64,

    pub created_at: DateTime<Utc>,
}
