//! Metadata persistence for deployments, release pointers and packages.
//!
//! Every piece of shared mutable state is guarded inside SQLite itself:
//! deployment versions are created under a UNIQUE constraint, pointers are
//! advanced by compare-and-swap, and labels come from an atomic counter.
//! A package is marked activated in the same transaction that first points a
//! version at it, so orphans are exactly the packages never activated.

use crate::models::{
    deployment::Deployment,
    deployment_version::DeploymentVersion,
    package::{NewPackage, Package, RELEASE_METHOD_UPLOAD},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const PACKAGE_COLUMNS: &str = "id, deployment_id, app_version, description, package_hash, \
     blob_url, manifest_blob_url, size, label, is_mandatory, release_method, released_by, created_at, \
     activated_at";

const VERSION_COLUMNS: &str =
    "id, deployment_id, app_version, is_mandatory, current_package_id, created_at";

/// Transactional metadata operations the release pipeline depends on.
///
/// Implementations must stay consistent under concurrent callers in
/// separate processes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_deployment(&self, deployment_id: i64) -> sqlx::Result<Option<Deployment>>;

    async fn create_deployment(&self, name: &str) -> sqlx::Result<Deployment>;

    async fn find_deployment_version(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<Option<DeploymentVersion>>;

    /// Create the row for the pair if missing and return whichever row won.
    async fn create_deployment_version(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<DeploymentVersion>;

    /// Point the version at `package_id` if its pointer still equals
    /// `expected_current`, marking the package activated. Returns false when
    /// the swap did not happen; nothing is written in that case.
    async fn advance_deployment_version(
        &self,
        version_id: i64,
        expected_current: Option<i64>,
        package_id: i64,
        is_mandatory: bool,
    ) -> sqlx::Result<bool>;

    async fn find_package_by_id(&self, package_id: i64) -> sqlx::Result<Option<Package>>;

    async fn find_package_by_label(
        &self,
        deployment_id: i64,
        label: &str,
    ) -> sqlx::Result<Option<Package>>;

    async fn list_packages(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<Vec<Package>>;

    async fn create_package(&self, package: NewPackage) -> sqlx::Result<Package>;

    /// Atomically bump and return the deployment's label counter.
    /// `None` when the deployment does not exist.
    async fn next_label(&self, deployment_id: i64) -> sqlx::Result<Option<i64>>;

    /// Packages no version was ever pointed at, i.e. rows created by a
    /// release whose pointer update never landed. A release still between
    /// `create_package` and its pointer swap shows up here briefly.
    async fn list_orphaned_packages(&self, deployment_id: i64) -> sqlx::Result<Vec<Package>>;

    async fn health_check(&self) -> sqlx::Result<()>;
}

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> sqlx::Result<usize> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn find_deployment(&self, deployment_id: i64) -> sqlx::Result<Option<Deployment>> {
        sqlx::query_as::<_, Deployment>(
            "SELECT id, name, label_id, created_at FROM deployments WHERE id = ?",
        )
        .bind(deployment_id)
        .fetch_optional(&*self.db)
        .await
    }

    async fn create_deployment(&self, name: &str) -> sqlx::Result<Deployment> {
        sqlx::query_as::<_, Deployment>(
            "INSERT INTO deployments (name, label_id, created_at) VALUES (?, 0, ?)
             RETURNING id, name, label_id, created_at",
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    async fn find_deployment_version(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<Option<DeploymentVersion>> {
        sqlx::query_as::<_, DeploymentVersion>(&format!(
            "SELECT {} FROM deployment_versions
             WHERE deployment_id = ? AND app_version = ?",
            VERSION_COLUMNS
        ))
        .bind(deployment_id)
        .bind(app_version)
        .fetch_optional(&*self.db)
        .await
    }

    async fn create_deployment_version(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<DeploymentVersion> {
        let inserted = sqlx::query(
            "INSERT INTO deployment_versions
                (deployment_id, app_version, is_mandatory, current_package_id, created_at)
             VALUES (?, ?, 0, NULL, ?)
             ON CONFLICT (deployment_id, app_version) DO NOTHING",
        )
        .bind(deployment_id)
        .bind(app_version)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(
                "deployment version ({}, {}) already existed, reusing it",
                deployment_id, app_version
            );
        }

        self.find_deployment_version(deployment_id, app_version)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn advance_deployment_version(
        &self,
        version_id: i64,
        expected_current: Option<i64>,
        package_id: i64,
        is_mandatory: bool,
    ) -> sqlx::Result<bool> {
        let mut tx = self.db.begin().await?;

        // `IS` compares NULL-safely, so an unset pointer can be swapped too.
        let swapped = sqlx::query(
            "UPDATE deployment_versions
             SET current_package_id = ?, is_mandatory = ?
             WHERE id = ? AND current_package_id IS ?",
        )
        .bind(package_id)
        .bind(is_mandatory)
        .bind(version_id)
        .bind(expected_current)
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE packages SET activated_at = COALESCE(activated_at, ?) WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(package_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_package_by_id(&self, package_id: i64) -> sqlx::Result<Option<Package>> {
        sqlx::query_as::<_, Package>(&format!(
            "SELECT {} FROM packages WHERE id = ?",
            PACKAGE_COLUMNS
        ))
        .bind(package_id)
        .fetch_optional(&*self.db)
        .await
    }

    async fn find_package_by_label(
        &self,
        deployment_id: i64,
        label: &str,
    ) -> sqlx::Result<Option<Package>> {
        sqlx::query_as::<_, Package>(&format!(
            "SELECT {} FROM packages WHERE deployment_id = ? AND label = ?",
            PACKAGE_COLUMNS
        ))
        .bind(deployment_id)
        .bind(label)
        .fetch_optional(&*self.db)
        .await
    }

    async fn list_packages(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> sqlx::Result<Vec<Package>> {
        sqlx::query_as::<_, Package>(&format!(
            "SELECT {} FROM packages
             WHERE deployment_id = ? AND app_version = ?
             ORDER BY id ASC",
            PACKAGE_COLUMNS
        ))
        .bind(deployment_id)
        .bind(app_version)
        .fetch_all(&*self.db)
        .await
    }

    async fn create_package(&self, package: NewPackage) -> sqlx::Result<Package> {
        sqlx::query_as::<_, Package>(&format!(
            "INSERT INTO packages (
                deployment_id, app_version, description, package_hash, blob_url,
                manifest_blob_url, size, label, is_mandatory, release_method,
                released_by, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            PACKAGE_COLUMNS
        ))
        .bind(package.deployment_id)
        .bind(&package.app_version)
        .bind(&package.description)
        .bind(&package.package_hash)
        .bind(&package.blob_url)
        .bind(&package.manifest_blob_url)
        .bind(package.size)
        .bind(&package.label)
        .bind(package.is_mandatory)
        .bind(RELEASE_METHOD_UPLOAD)
        .bind(&package.released_by)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    async fn next_label(&self, deployment_id: i64) -> sqlx::Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE deployments SET label_id = label_id + 1 WHERE id = ? RETURNING label_id",
        )
        .bind(deployment_id)
        .fetch_optional(&*self.db)
        .await
    }

    async fn list_orphaned_packages(&self, deployment_id: i64) -> sqlx::Result<Vec<Package>> {
        sqlx::query_as::<_, Package>(&format!(
            "SELECT {} FROM packages
             WHERE deployment_id = ? AND activated_at IS NULL
             ORDER BY id ASC",
            PACKAGE_COLUMNS
        ))
        .bind(deployment_id)
        .fetch_all(&*self.db)
        .await
    }

    async fn health_check(&self) -> sqlx::Result<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one == 1 {
            Ok(())
        } else {
            Err(sqlx::Error::Protocol(format!("unexpected result: {}", one)))
        }
    }
}
