//! Manifest construction for extracted packages.
//!
//! A manifest maps every regular file of a package, by its slash-separated
//! path relative to the package root, to the hash of its contents. Entries
//! live in a `BTreeMap`, so serialization order is the byte order of the
//! paths and never depends on the order the filesystem yields them.

use crate::services::{
    error::{ExtractionError, ReleaseError, ReleaseResult},
    hasher,
};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

/// Sorted relative path -> content hash mapping.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Compact JSON with keys in byte order.
    pub fn to_canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.entries)
    }
}

/// A built manifest together with its serialized form.
#[derive(Clone, Debug)]
pub struct ManifestDocument {
    pub manifest: Manifest,
    pub bytes: Vec<u8>,
}

/// Walks an extracted package and hashes its files with bounded fan-out.
#[derive(Clone, Debug)]
pub struct ManifestBuilder {
    concurrency: usize,
}

impl ManifestBuilder {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Build the manifest for the package rooted at `root`.
    ///
    /// Waits for every file hash; the first failure aborts the build.
    pub async fn build(&self, root: &Path) -> ReleaseResult<ManifestDocument> {
        let files = collect_files(root).await?;
        if files.is_empty() {
            return Err(ReleaseError::EmptyPackage);
        }
        debug!(
            "hashing {} files under {} (concurrency {})",
            files.len(),
            root.display(),
            self.concurrency
        );

        let entries: Vec<(String, String)> = stream::iter(files)
            .map(|(relative, path)| async move {
                let hash = hasher::hash_file(&path).await?;
                Ok::<_, ReleaseError>((relative, hash))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let manifest = Manifest::from_entries(entries);
        let bytes = manifest
            .to_canonical_json()
            .map_err(|err| ReleaseError::Io(err.into()))?;
        Ok(ManifestDocument { manifest, bytes })
    }
}

/// Recursively list regular files as (relative path, absolute path).
///
/// Symlinks are refused rather than followed.
async fn collect_files(root: &Path) -> ReleaseResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                let relative = relative_path(root, &path)?;
                return Err(ExtractionError::SymlinkRejected(relative).into());
            }
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = relative_path(root, &path)?;
                files.push((relative, path));
            }
        }
    }

    Ok(files)
}

/// Path of `path` relative to `root`, joined with forward slashes.
fn relative_path(root: &Path, path: &Path) -> ReleaseResult<String> {
    let stripped = path.strip_prefix(root).map_err(|_| {
        ReleaseError::UploadMalformed(format!(
            "{} is outside of {}",
            path.display(),
            root.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    ReleaseError::UploadMalformed(format!(
                        "file name {} is not valid UTF-8",
                        path.display()
                    ))
                })?;
                parts.push(part);
            }
            other => {
                return Err(ReleaseError::UploadMalformed(format!(
                    "unexpected path component {:?} in {}",
                    other,
                    path.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::hash_bytes;

    fn write(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn manifest_uses_relative_forward_slash_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.bundle", b"bundle");
        write(dir.path(), "assets/img/logo.png", b"png");

        let doc = ManifestBuilder::new(4).build(dir.path()).await.unwrap();
        assert_eq!(doc.manifest.len(), 2);
        assert_eq!(
            doc.manifest.get("assets/img/logo.png"),
            Some(hash_bytes(b"png").as_str())
        );
        assert_eq!(
            doc.manifest.get("index.bundle"),
            Some(hash_bytes(b"bundle").as_str())
        );
    }

    #[tokio::test]
    async fn serialized_bytes_do_not_depend_on_creation_order() {
        let files: [(&str, &[u8]); 4] = [
            ("z.js", b"z"),
            ("a/b.js", b"b"),
            ("A.txt", b"upper"),
            ("a.js", b"a"),
        ];

        let first = tempfile::tempdir().unwrap();
        for (path, contents) in files.iter() {
            write(first.path(), path, contents);
        }
        let second = tempfile::tempdir().unwrap();
        for (path, contents) in files.iter().rev() {
            write(second.path(), path, contents);
        }

        let a = ManifestBuilder::new(1).build(first.path()).await.unwrap();
        let b = ManifestBuilder::new(8).build(second.path()).await.unwrap();
        assert_eq!(a.bytes, b.bytes);

        let keys: Vec<&str> = a.manifest.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A.txt", "a.js", "a/b.js", "z.js"]);
    }

    #[test]
    fn canonical_json_is_compact_and_sorted() {
        let manifest = Manifest::from_entries(vec![
            ("b.txt".to_string(), "22".to_string()),
            ("a.txt".to_string(), "11".to_string()),
        ]);
        let json = manifest.to_canonical_json().unwrap();
        assert_eq!(json, br#"{"a.txt":"11","b.txt":"22"}"#.to_vec());
    }

    #[tokio::test]
    async fn empty_directory_is_an_empty_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("only/dirs")).unwrap();
        let err = ManifestBuilder::new(2).build(dir.path()).await.unwrap_err();
        assert!(matches!(err, ReleaseError::EmptyPackage));
    }

    #[tokio::test]
    async fn zero_byte_files_are_included() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "empty.txt", b"");
        let doc = ManifestBuilder::new(2).build(dir.path()).await.unwrap();
        assert_eq!(
            doc.manifest.get("empty.txt"),
            Some(hash_bytes(b"").as_str())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real.txt", b"real");
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let err = ManifestBuilder::new(2).build(dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::ExtractionFailed(ExtractionError::SymlinkRejected(ref p)) if p == "link.txt"
        ));
    }
}
