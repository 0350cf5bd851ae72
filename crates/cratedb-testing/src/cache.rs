//! Download and extraction of CrateDB distributions.
//!
//! A cache folder is only ever created by renaming a fully extracted
//! temporary directory into place, so a folder that exists is complete.
//! Concurrent callers may both download; the loser of the final rename
//! discards its copy.

use crate::error::DownloadErrorKind;
use crate::source::DownloadSource;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use futures::StreamExt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// An extracted, runnable distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Root of the distribution (contains `bin/`, `lib/`, ...).
    pub root: PathBuf,
}

/// Cache of extracted distributions under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    client: reqwest::Client,
}

impl ArtifactCache {
    /// Creates a cache rooted at `root` (usually `<base>/downloads`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Returns the cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if `source` is already extracted.
    pub fn contains(&self, source: &DownloadSource) -> bool {
        source.cache_folder(&self.root).is_dir()
    }

    /// Makes sure `source` is extracted and returns its location.
    ///
    /// A cache hit performs no network or archive I/O.
    pub async fn ensure(&self, source: &DownloadSource) -> Result<Artifact> {
        let target = source.cache_folder(&self.root);
        if target.is_dir() {
            debug!(%source, path = %target.display(), "artifact cache hit");
            return Ok(Artifact { root: target });
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::download(DownloadErrorKind::Io, source, e))?;

        let run_id = Uuid::new_v4();
        let folder = source.folder_name();
        let staging = self.root.join(format!("{folder}.tmp-{run_id}"));

        let result = match source.local_path() {
            Some(archive) => {
                info!(%source, "extracting local archive");
                extract_into(archive, staging.clone(), source).await
            }
            None => {
                let part = self.root.join(format!("{folder}.part-{run_id}"));
                let fetched = self.download(source, &part).await;
                let extracted = match fetched {
                    Ok(()) => extract_into(part.clone(), staging.clone(), source).await,
                    Err(e) => Err(e),
                };
                remove_quietly(&part);
                extracted
            }
        };

        if let Err(e) = result {
            remove_quietly(&staging);
            return Err(e);
        }

        publish(&staging, &target, source)?;
        info!(%source, path = %target.display(), "artifact ready");
        Ok(Artifact { root: target })
    }

    async fn download(&self, source: &DownloadSource, part: &Path) -> Result<()> {
        let url = source.resolve_url()?;
        info!(%source, %url, part = %part.display(), "downloading distribution");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::download(DownloadErrorKind::Network, source, e))?;

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| Error::download(DownloadErrorKind::Io, source, e))?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::download(DownloadErrorKind::Network, source, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::download(DownloadErrorKind::Io, source, e))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::download(DownloadErrorKind::Io, source, e))?;
        Ok(())
    }
}

/// Copies an extracted distribution into a node's private working directory.
pub fn prepare_working_copy(artifact: &Artifact, dest: &Path) -> Result<()> {
    copy_tree(&artifact.root, dest)?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            // fs::copy carries permission bits over, including the executable bit.
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

async fn extract_into(archive: PathBuf, dest: PathBuf, source: &DownloadSource) -> Result<()> {
    let source_ref = source.to_string();
    tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &dest, &source_ref))
        .await
        .map_err(|e| Error::download(DownloadErrorKind::Io, source, e))?
}

/// Unpacks `archive` into `dest`, dropping the archive's top-level folder.
fn extract_tar_gz(archive: &Path, dest: &Path, source_ref: &str) -> Result<()> {
    let io_err = |e: io::Error| Error::download(DownloadErrorKind::Io, source_ref, e);
    let corrupt = |e: io::Error| Error::download(DownloadErrorKind::CorruptArchive, source_ref, e);

    let file = fs::File::open(archive).map_err(io_err)?;
    fs::create_dir_all(dest).map_err(io_err)?;

    let mut tar = tar::Archive::new(GzDecoder::new(io::BufReader::new(file)));
    let mut extracted = 0usize;
    for entry in tar.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();
        let Some(stripped) = strip_root(&path) else {
            continue;
        };
        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| Error::download(unpack_error_kind(&e), source_ref, e))?;
        if is_launcher_binary(&stripped) {
            make_executable(&target).map_err(io_err)?;
        }
        extracted += 1;
    }

    if extracted == 0 {
        return Err(Error::download(
            DownloadErrorKind::CorruptArchive,
            source_ref,
            "archive contains no files below its root folder",
        ));
    }
    debug!(source = source_ref, entries = extracted, "archive extracted");
    Ok(())
}

/// Write-side failures are local I/O; anything else is a bad archive.
fn unpack_error_kind(err: &io::Error) -> DownloadErrorKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::StorageFull
        | io::ErrorKind::QuotaExceeded
        | io::ErrorKind::ReadOnlyFilesystem
        | io::ErrorKind::AlreadyExists
        | io::ErrorKind::NotFound
        | io::ErrorKind::IsADirectory
        | io::ErrorKind::NotADirectory => DownloadErrorKind::Io,
        _ => DownloadErrorKind::CorruptArchive,
    }
}

/// Drops the first path component; rejects absolute and `..` paths.
fn strip_root(path: &Path) -> Option<PathBuf> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match components.next() {
        Some(Component::Normal(_)) => {}
        _ => return None,
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() || rest.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(rest)
}

/// Launcher scripts and bundled runtime binaries live in a `bin` folder.
fn is_launcher_binary(path: &Path) -> bool {
    path.parent()
        .is_some_and(|parent| parent.components().any(|c| c.as_os_str() == "bin"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_file() {
        return Ok(());
    }
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn publish(staging: &Path, target: &Path, source: &DownloadSource) -> Result<()> {
    match fs::rename(staging, target) {
        Ok(()) => Ok(()),
        Err(_) if target.is_dir() => {
            debug!(%source, "another caller published the artifact first");
            remove_quietly(staging);
            Ok(())
        }
        Err(e) => {
            remove_quietly(staging);
            Err(Error::download(DownloadErrorKind::Io, source, e))
        }
    }
}

fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "failed to remove temporary path");
        }
    }
}
