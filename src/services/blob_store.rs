//! Durable, content-addressed blob storage.
//!
//! Keys are content hashes. Blobs are sharded on disk beneath
//! `root/{shard}/{shard}/{key}` and written through a temp file that is
//! fsynced and renamed into place, so readers never see a partial blob.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 128;

/// Blob storage used to persist manifests and raw archives.
///
/// Writing a key that already exists with the same bytes must be a no-op.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_bytes(&self, key: &str, bytes: Bytes) -> io::Result<()>;

    /// Store a file without reading it fully into memory.
    async fn put_file(&self, key: &str, path: &Path) -> io::Result<()>;

    async fn exists(&self, key: &str) -> io::Result<bool>;

    /// Verify the store is writable.
    async fn health_check(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Local-disk blob store.
#[derive(Clone, Debug)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keys are content hashes: lowercase hex only.
    fn ensure_key_safe(key: &str) -> io::Result<()> {
        let valid = !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(())
        } else {
            Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob key `{}`", key),
            ))
        }
    }

    /// Two-level shard directories from MD5(key).
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// On-disk location of a blob. Parent directories may not exist yet.
    pub fn blob_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn write_stream<S>(&self, key: &str, stream: S) -> io::Result<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::ensure_key_safe(key)?;
        let blob_path = self.blob_path(key);
        if fs::try_exists(&blob_path).await? {
            debug!("blob {} already stored, skipping write", key);
            return Ok(());
        }

        let parent = blob_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = write_tmp(&tmp_path, stream).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &blob_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            // Another writer may have stored the same content first.
            if fs::try_exists(&blob_path).await.unwrap_or(false) {
                return Ok(());
            }
            return Err(err);
        }

        debug!("stored blob {} at {}", key, blob_path.display());
        Ok(())
    }
}

async fn write_tmp<S>(tmp_path: &Path, stream: S) -> io::Result<u64>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(tmp_path).await?;
    let mut written: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put_bytes(&self, key: &str, bytes: Bytes) -> io::Result<()> {
        self.write_stream(key, stream::once(async move { Ok::<_, io::Error>(bytes) }))
            .await
    }

    async fn put_file(&self, key: &str, path: &Path) -> io::Result<()> {
        let file = File::open(path).await?;
        self.write_stream(key, ReaderStream::new(file)).await
    }

    async fn exists(&self, key: &str) -> io::Result<bool> {
        Self::ensure_key_safe(key)?;
        fs::try_exists(self.blob_path(key)).await
    }

    /// Write, read back and delete a marker file under the root.
    async fn health_check(&self) -> io::Result<()> {
        let marker = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&marker, b"readyz").await?;
        let read = fs::read(&marker).await;
        let removed = fs::remove_file(&marker).await;
        if read? != b"readyz" {
            return Err(io::Error::other("readiness marker content mismatch"));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::hash_bytes;

    #[tokio::test]
    async fn stores_bytes_under_sharded_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        let key = hash_bytes(b"manifest");

        store
            .put_bytes(&key, Bytes::from_static(b"manifest"))
            .await
            .unwrap();

        let path = store.blob_path(&key);
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.components().count(), dir.path().components().count() + 3);
        assert_eq!(std::fs::read(path).unwrap(), b"manifest");
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn rewriting_an_existing_key_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        let key = hash_bytes(b"same");

        store.put_bytes(&key, Bytes::from_static(b"same")).await.unwrap();
        store.put_bytes(&key, Bytes::from_static(b"same")).await.unwrap();

        let parent = store.blob_path(&key).parent().unwrap().to_path_buf();
        let entries: Vec<_> = std::fs::read_dir(parent).unwrap().collect();
        assert_eq!(entries.len(), 1, "no temp files left behind");
    }

    #[tokio::test]
    async fn streams_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("archive.zip");
        let payload = vec![42_u8; 200 * 1024];
        std::fs::write(&source, &payload).unwrap();

        let store = DiskBlobStore::new(dir.path().join("blobs"));
        let key = hash_bytes(&payload);
        store.put_file(&key, &source).await.unwrap();
        assert_eq!(std::fs::read(store.blob_path(&key)).unwrap(), payload);
    }

    #[tokio::test]
    async fn health_check_leaves_no_probe_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        store.health_check().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let missing = DiskBlobStore::new(dir.path().join("missing"));
        assert!(missing.health_check().await.is_err());
    }

    #[tokio::test]
    async fn rejects_non_hash_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        for key in ["", "../escape", "ABCDEF", "abc/def"] {
            let err = store
                .put_bytes(key, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
    }
}
