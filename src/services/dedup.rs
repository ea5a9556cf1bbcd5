//! Duplicate-release detection against the current package of a
//! (deployment, app version) pair.

use crate::{
    models::deployment_version::DeploymentVersion,
    services::{error::ReleaseResult, metadata_store::MetadataStore},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a dedup check.
///
/// `version` is the pointer row as observed during the check; its
/// `current_package_id` is the expected value for the later pointer swap.
#[derive(Clone, Debug)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub version: DeploymentVersion,
}

#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn MetadataStore>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Decide whether `manifest_hash` is already the current release of the
    /// pair, creating the pair's version row on first sight.
    pub async fn check_and_reserve(
        &self,
        deployment_id: i64,
        app_version: &str,
        manifest_hash: &str,
    ) -> ReleaseResult<DedupOutcome> {
        let version = match self
            .store
            .find_deployment_version(deployment_id, app_version)
            .await?
        {
            Some(version) => version,
            None => {
                let version = self
                    .store
                    .create_deployment_version(deployment_id, app_version)
                    .await?;
                debug!(
                    "created deployment version {} for ({}, {})",
                    version.id, deployment_id, app_version
                );
                // A racing creator may already have released into this row,
                // so fall through to the regular pointer comparison.
                version
            }
        };

        let Some(current_id) = version.current_package() else {
            return Ok(DedupOutcome {
                is_duplicate: false,
                version,
            });
        };

        let is_duplicate = match self.store.find_package_by_id(current_id).await? {
            Some(current) => current.package_hash.as_bytes() == manifest_hash.as_bytes(),
            None => {
                warn!(
                    "deployment version {} points at missing package {}",
                    version.id, current_id
                );
                false
            }
        };

        Ok(DedupOutcome {
            is_duplicate,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::package::NewPackage,
        services::metadata_store::{SqliteMetadataStore, tests::memory_store},
    };

    async fn engine() -> (DedupEngine, SqliteMetadataStore, i64) {
        let store = memory_store().await;
        let dep = store.create_deployment("Staging").await.unwrap();
        (DedupEngine::new(Arc::new(store.clone())), store, dep.id)
    }

    async fn release(store: &SqliteMetadataStore, version: &DeploymentVersion, hash: &str) -> i64 {
        let package = store
            .create_package(NewPackage {
                deployment_id: version.deployment_id,
                app_version: version.app_version.clone(),
                description: String::new(),
                package_hash: hash.into(),
                blob_url: "00".into(),
                manifest_blob_url: hash.into(),
                size: 1,
                label: format!("v{}", hash),
                is_mandatory: false,
                released_by: "tester".into(),
            })
            .await
            .unwrap();
        assert!(
            store
                .advance_deployment_version(
                    version.id,
                    version.current_package_id,
                    package.id,
                    false
                )
                .await
                .unwrap()
        );
        package.id
    }

    #[tokio::test]
    async fn first_release_creates_the_version_row() {
        let (engine, store, dep) = engine().await;
        let outcome = engine.check_and_reserve(dep, "1.0", "abc").await.unwrap();
        assert!(!outcome.is_duplicate);
        assert_eq!(outcome.version.current_package(), None);
        assert!(!outcome.version.is_mandatory);
        assert!(store.find_deployment_version(dep, "1.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn only_the_current_hash_is_a_duplicate() {
        let (engine, store, dep) = engine().await;
        let outcome = engine.check_and_reserve(dep, "1.0", "abc").await.unwrap();
        release(&store, &outcome.version, "abc").await;

        assert!(engine.check_and_reserve(dep, "1.0", "abc").await.unwrap().is_duplicate);
        // Byte-for-byte: no case folding, no prefix matching.
        assert!(!engine.check_and_reserve(dep, "1.0", "ABC").await.unwrap().is_duplicate);
        assert!(!engine.check_and_reserve(dep, "1.0", "ab").await.unwrap().is_duplicate);
        // Same content under another app version is not a duplicate.
        assert!(!engine.check_and_reserve(dep, "2.0", "abc").await.unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn older_releases_do_not_count_as_duplicates() {
        let (engine, store, dep) = engine().await;
        let first = engine.check_and_reserve(dep, "1.0", "aaa").await.unwrap();
        release(&store, &first.version, "aaa").await;
        let second = engine.check_and_reserve(dep, "1.0", "bbb").await.unwrap();
        release(&store, &second.version, "bbb").await;

        assert!(!engine.check_and_reserve(dep, "1.0", "aaa").await.unwrap().is_duplicate);
        assert!(engine.check_and_reserve(dep, "1.0", "bbb").await.unwrap().is_duplicate);
    }
}
