//! Content hashing for files, streams and in-memory documents.
//!
//! Every digest is SHA-256 rendered as lowercase hex. Only the bytes take
//! part; names, paths and timestamps never do.

use crate::services::error::{ReleaseError, ReleaseResult};
use sha2::{Digest, Sha256};
use std::{io, path::Path};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt},
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash an in-memory byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash everything readable from `reader` using a fixed-size buffer.
pub async fn hash_reader<R>(reader: R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stream a file from disk through the hasher.
pub async fn hash_file(path: &Path) -> ReleaseResult<String> {
    let wrap = |source| ReleaseError::HashComputationFailed {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(wrap)?;
    hash_reader(file).await.map_err(wrap)
}
