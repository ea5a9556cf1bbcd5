//! src/services/release_service.rs
//!
//! ReleaseService: the upload-to-release pipeline.
//!
//! archive stage -> manifest builder -> dedup engine -> registrar
//!
//! Any stage error aborts the remaining stages. Staged directories and
//! uploaded files are left for the caller to clean up: `prepare` hands back
//! the staging location before anything can be rejected, so the caller can
//! discard it whatever `release_prepared` returns.

use crate::{
    models::{
        deployment::Deployment,
        package::{Package, PackageInfo},
    },
    services::{
        archive::{ArchiveStage, StagedArchive},
        blob_store::BlobStore,
        dedup::DedupEngine,
        error::{ReleaseError, ReleaseResult},
        hasher,
        manifest::ManifestBuilder,
        metadata_store::MetadataStore,
        registrar::{Registration, ReleaseRegistrar},
    },
};
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ReleaseService {
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    archive: ArchiveStage,
    manifest: ManifestBuilder,
    dedup: DedupEngine,
    registrar: ReleaseRegistrar,
}

impl ReleaseService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        archive: ArchiveStage,
        manifest: ManifestBuilder,
    ) -> Self {
        Self {
            dedup: DedupEngine::new(store.clone()),
            registrar: ReleaseRegistrar::new(store.clone(), blobs.clone()),
            store,
            blobs,
            archive,
            manifest,
        }
    }

    pub fn archive_stage(&self) -> &ArchiveStage {
        &self.archive
    }

    /// Check the request, hash the archive and reserve its staging
    /// directory. Nothing has been extracted when this returns.
    pub async fn prepare(
        &self,
        deployment_id: i64,
        info: &PackageInfo,
        archive_path: &Path,
        mime_type: &str,
    ) -> ReleaseResult<StagedArchive> {
        if info.app_version.trim().is_empty() {
            return Err(ReleaseError::UploadMalformed(
                "packageInfo.appVersion is required".into(),
            ));
        }
        self.fetch_deployment(deployment_id).await?;
        self.archive.prepare(archive_path, mime_type).await
    }

    /// Extract, fingerprint, deduplicate and register a prepared archive.
    pub async fn release_prepared(
        &self,
        deployment_id: i64,
        info: &PackageInfo,
        staged: &StagedArchive,
        released_by: &str,
    ) -> ReleaseResult<Package> {
        self.archive.extract(staged).await?;
        let manifest = self.manifest.build(&staged.directory).await?;
        let manifest_hash = hasher::hash_bytes(&manifest.bytes);

        let dedup = self
            .dedup
            .check_and_reserve(deployment_id, &info.app_version, &manifest_hash)
            .await?;
        if dedup.is_duplicate {
            warn!(
                "rejecting duplicate release {} for deployment {} app version {}",
                manifest_hash, deployment_id, info.app_version
            );
            return Err(ReleaseError::DuplicateRelease {
                deployment_id,
                app_version: info.app_version.clone(),
            });
        }

        self.registrar
            .register(Registration {
                deployment_id,
                info,
                staged,
                manifest: &manifest,
                manifest_hash: &manifest_hash,
                dedup: &dedup,
                released_by,
            })
            .await
    }

    pub async fn create_deployment(&self, name: &str) -> ReleaseResult<Deployment> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ReleaseError::UploadMalformed(
                "deployment name is required".into(),
            ));
        }
        let deployment = self.store.create_deployment(name).await?;
        info!("created deployment {} ({})", deployment.name, deployment.id);
        Ok(deployment)
    }

    pub async fn fetch_deployment(&self, deployment_id: i64) -> ReleaseResult<Deployment> {
        self.store
            .find_deployment(deployment_id)
            .await?
            .ok_or(ReleaseError::DeploymentNotFound(deployment_id))
    }

    pub async fn list_packages(
        &self,
        deployment_id: i64,
        app_version: &str,
    ) -> ReleaseResult<Vec<Package>> {
        self.fetch_deployment(deployment_id).await?;
        Ok(self.store.list_packages(deployment_id, app_version).await?)
    }

    pub async fn find_package_by_label(
        &self,
        deployment_id: i64,
        label: &str,
    ) -> ReleaseResult<Package> {
        self.store
            .find_package_by_label(deployment_id, label)
            .await?
            .ok_or_else(|| ReleaseError::PackageNotFound {
                deployment_id,
                label: label.to_string(),
            })
    }

    pub async fn list_orphaned_packages(&self, deployment_id: i64) -> ReleaseResult<Vec<Package>> {
        self.fetch_deployment(deployment_id).await?;
        Ok(self.store.list_orphaned_packages(deployment_id).await?)
    }
}
