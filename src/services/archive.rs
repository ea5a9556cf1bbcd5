//! Staging of uploaded archives.
//!
//! An upload is hashed as-is (the archive hash), then extracted into its
//! own attempt directory `<staging_root>/<archive_hash>/<attempt>`. Every
//! attempt for the same archive lives under the same hash directory, but
//! concurrent attempts never share files.

use crate::services::{
    error::{ExtractionError, ReleaseError, ReleaseResult},
    hasher,
};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipArchive;

/// Declared MIME types accepted as zip archives.
pub const SUPPORTED_ARCHIVE_TYPES: [&str; 2] = ["application/zip", "application/x-zip-compressed"];

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// An archive that has been hashed and given an extraction directory.
#[derive(Clone, Debug)]
pub struct StagedArchive {
    /// Path of the raw uploaded archive.
    pub archive_path: PathBuf,
    /// Content hash of the raw archive bytes.
    pub archive_hash: String,
    /// Size of the raw archive in bytes.
    pub size: u64,
    /// Directory holding the extracted package for this attempt.
    pub directory: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ArchiveStage {
    staging_root: PathBuf,
}

impl ArchiveStage {
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
        }
    }

    /// Fresh location for an incoming upload before it has been hashed.
    pub fn upload_path(&self) -> PathBuf {
        self.staging_root
            .join("uploads")
            .join(format!("{}.upload", Uuid::new_v4()))
    }

    /// Directory holding every extraction attempt of the given archive.
    pub fn staging_dir(&self, archive_hash: &str) -> PathBuf {
        self.staging_root.join(archive_hash)
    }

    /// Validate the declared type, hash the archive and create an empty
    /// attempt directory for it. Nothing is extracted yet.
    pub async fn prepare(
        &self,
        archive_path: &Path,
        mime_type: &str,
    ) -> ReleaseResult<StagedArchive> {
        ensure_supported_type(mime_type)?;

        let archive_hash = hasher::hash_file(archive_path).await?;
        let size = fs::metadata(archive_path).await?.len();
        let directory = self
            .staging_dir(&archive_hash)
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&directory).await?;

        Ok(StagedArchive {
            archive_path: archive_path.to_path_buf(),
            archive_hash,
            size,
            directory,
        })
    }

    /// Extract a prepared archive into its attempt directory.
    ///
    /// On failure the directory is left in place for `discard`.
    pub async fn extract(&self, staged: &StagedArchive) -> ReleaseResult<usize> {
        debug!(
            "extracting {} ({} bytes) into {}",
            staged.archive_path.display(),
            staged.size,
            staged.directory.display()
        );
        let source = staged.archive_path.clone();
        let target = staged.directory.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_zip(&source, &target))
            .await
            .map_err(|err| ExtractionError::Io(io::Error::other(err)))??;
        info!(
            "staged archive {} ({} entries)",
            staged.archive_hash, extracted
        );
        Ok(extracted)
    }

    /// Validate, hash and extract an uploaded archive.
    pub async fn stage(&self, archive_path: &Path, mime_type: &str) -> ReleaseResult<StagedArchive> {
        let staged = self.prepare(archive_path, mime_type).await?;
        self.extract(&staged).await?;
        Ok(staged)
    }

    /// Remove this attempt's directory, and the hash directory once no
    /// other attempt is using it. Missing directories are fine.
    pub async fn discard(&self, staged: &StagedArchive) -> io::Result<()> {
        match fs::remove_dir_all(&staged.directory).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        // Fails while a concurrent attempt still has its directory here.
        if let Err(err) = fs::remove_dir(self.staging_dir(&staged.archive_hash)).await {
            debug!(
                "keeping staging directory for {}: {}",
                staged.archive_hash, err
            );
        }
        Ok(())
    }
}

fn ensure_supported_type(mime_type: &str) -> ReleaseResult<()> {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    if SUPPORTED_ARCHIVE_TYPES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(essence))
    {
        Ok(())
    } else {
        Err(ReleaseError::UnsupportedFileType(mime_type.to_string()))
    }
}

/// Validate a raw entry name and turn it into a path below the root.
///
/// Rejects absolute names, drive prefixes and any `..` segment, whichever
/// separator is used.
fn safe_entry_path(name: &str) -> Result<PathBuf, ExtractionError> {
    let reject = || ExtractionError::PathTraversalRejected(name.to_string());

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(reject());
    }
    let mut path = PathBuf::new();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(reject()),
            s if s.contains(':') || s.contains('\0') => return Err(reject()),
            s => path.push(s),
        }
    }
    Ok(path)
}

/// Reject archives where one path is both a file and a directory, or
/// where the same file appears twice.
fn check_entry_conflicts(planned: &[(usize, String, PathBuf, bool)]) -> Result<(), ExtractionError> {
    let mut files: HashMap<&Path, &str> = HashMap::new();
    let mut dirs: HashSet<&Path> = HashSet::new();

    for (_, name, relative, is_dir) in planned {
        if *is_dir {
            dirs.insert(relative.as_path());
        } else if files.insert(relative.as_path(), name.as_str()).is_some() {
            return Err(ExtractionError::EntryConflict(name.clone()));
        }
        for ancestor in relative.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                dirs.insert(ancestor);
            }
        }
    }

    match files.iter().find(|(path, _)| dirs.contains(*path)) {
        Some((_, name)) => Err(ExtractionError::EntryConflict(name.to_string())),
        None => Ok(()),
    }
}

/// Extract every entry of the zip at `source` under `target`.
///
/// All entry names are checked before anything is written, so a hostile
/// or inconsistent archive leaves no files behind.
fn extract_zip(source: &Path, target: &Path) -> Result<usize, ExtractionError> {
    let file = File::open(source)?;
    let mut archive = ZipArchive::new(file)?;

    let mut planned = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let relative = safe_entry_path(&name)?;
        if entry.enclosed_name().is_none() {
            return Err(ExtractionError::PathTraversalRejected(name));
        }
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(ExtractionError::SymlinkRejected(name));
        }
        let is_dir = entry.is_dir();
        if relative.as_os_str().is_empty() {
            continue;
        }
        planned.push((i, name, relative, is_dir));
    }
    check_entry_conflicts(&planned)?;

    let mut written = 0;
    for (i, _, relative, is_dir) in planned {
        let dest = target.join(&relative);
        if is_dir {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = archive.by_index(i)?;
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}
