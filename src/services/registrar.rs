//! Registration of novel releases: blob uploads, label allocation,
//! package creation and pointer advancement, in that order.

use crate::{
    models::package::{NewPackage, Package, PackageInfo, format_label},
    services::{
        archive::StagedArchive,
        blob_store::BlobStore,
        dedup::DedupOutcome,
        error::{ReleaseError, ReleaseResult},
        manifest::ManifestDocument,
        metadata_store::MetadataStore,
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Everything the registrar needs about one release attempt.
pub struct Registration<'a> {
    pub deployment_id: i64,
    pub info: &'a PackageInfo,
    pub staged: &'a StagedArchive,
    pub manifest: &'a ManifestDocument,
    pub manifest_hash: &'a str,
    pub dedup: &'a DedupOutcome,
    pub released_by: &'a str,
}

#[derive(Clone)]
pub struct ReleaseRegistrar {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl ReleaseRegistrar {
    pub fn new(store: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Persist a release that the dedup engine found to be novel.
    ///
    /// Blob failures abort before any metadata is written. A failure after
    /// the package row exists leaves an orphan: it is reported as
    /// `DuplicateRelease` when a concurrent release of the same content won
    /// the swap, and as `PointerUpdateFailed` otherwise.
    pub async fn register(&self, reg: Registration<'_>) -> ReleaseResult<Package> {
        let manifest_key = reg.manifest_hash;
        let archive_key = reg.staged.archive_hash.as_str();

        self.blobs
            .put_bytes(manifest_key, Bytes::copy_from_slice(&reg.manifest.bytes))
            .await
            .map_err(|source| ReleaseError::BlobUploadFailed {
                key: manifest_key.to_string(),
                source,
            })?;
        let archive_failed = |source: std::io::Error| ReleaseError::BlobUploadFailed {
            key: archive_key.to_string(),
            source,
        };
        if self.blobs.exists(archive_key).await.map_err(archive_failed)? {
            debug!("archive blob {} already stored", archive_key);
        } else {
            self.blobs
                .put_file(archive_key, &reg.staged.archive_path)
                .await
                .map_err(archive_failed)?;
        }

        let label_id = self
            .store
            .next_label(reg.deployment_id)
            .await?
            .ok_or(ReleaseError::DeploymentNotFound(reg.deployment_id))?;

        let package = self
            .store
            .create_package(NewPackage {
                deployment_id: reg.deployment_id,
                app_version: reg.info.app_version.clone(),
                description: reg.info.description.clone(),
                package_hash: reg.manifest_hash.to_string(),
                blob_url: archive_key.to_string(),
                manifest_blob_url: manifest_key.to_string(),
                size: reg.staged.size as i64,
                label: format_label(label_id),
                is_mandatory: reg.info.is_mandatory,
                released_by: reg.released_by.to_string(),
            })
            .await?;

        let version = &reg.dedup.version;
        let advanced = self
            .store
            .advance_deployment_version(
                version.id,
                version.current_package_id,
                package.id,
                reg.info.is_mandatory,
            )
            .await;

        let orphan_error = match advanced {
            Ok(true) => {
                info!(
                    "released {} ({} files) to deployment {} app version {} as package {}",
                    package.label,
                    reg.manifest.manifest.len(),
                    package.deployment_id,
                    package.app_version,
                    package.id
                );
                return Ok(package);
            }
            Ok(false) => {
                if self.current_matches(&reg).await? {
                    ReleaseError::DuplicateRelease {
                        deployment_id: reg.deployment_id,
                        app_version: reg.info.app_version.clone(),
                    }
                } else {
                    ReleaseError::PointerUpdateFailed {
                        package_id: package.id,
                        deployment_id: reg.deployment_id,
                        app_version: reg.info.app_version.clone(),
                        reason: "current package changed concurrently".to_string(),
                    }
                }
            }
            Err(err) => ReleaseError::PointerUpdateFailed {
                package_id: package.id,
                deployment_id: reg.deployment_id,
                app_version: reg.info.app_version.clone(),
                reason: err.to_string(),
            },
        };

        error!(
            package_id = package.id,
            deployment_id = reg.deployment_id,
            app_version = %reg.info.app_version,
            "orphaned package: pointer update failed: {}",
            orphan_error
        );
        Err(orphan_error)
    }

    /// Whether the pair's current package, as it is now, carries the
    /// manifest being registered.
    async fn current_matches(&self, reg: &Registration<'_>) -> ReleaseResult<bool> {
        let current = self
            .store
            .find_deployment_version(reg.deployment_id, &reg.info.app_version)
            .await?
            .and_then(|version| version.current_package());
        let Some(current_id) = current else {
            return Ok(false);
        };
        Ok(self
            .store
            .find_package_by_id(current_id)
            .await?
            .is_some_and(|package| package.package_hash == reg.manifest_hash))
    }
}
