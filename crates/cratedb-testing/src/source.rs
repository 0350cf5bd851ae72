//! Where a CrateDB distribution comes from.

use crate::version::CrateVersion;
use crate::{Error, Result};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Release archives published on the CrateDB CDN.
pub const VERSION_DOWNLOAD_URL: &str = "https://cdn.crate.io/downloads/releases";

/// A logical reference to a `.tar.gz` CrateDB distribution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DownloadSource {
    /// A released version, fetched from the CDN.
    Version(String),
    /// An arbitrary `http(s)://` or `file://` URL.
    Url(String),
    /// A local archive, stored as an absolute path.
    File(PathBuf),
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

impl DownloadSource {
    /// A released version such as `4.8.1`.
    pub fn version(version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        if CrateVersion::parse(&version).is_none() {
            return Err(Error::invalid_source(
                format!("VERSION[{version}]"),
                "expected a dotted numeric version like 4.8.1",
            ));
        }
        Ok(Self::Version(version.trim().to_string()))
    }

    /// A download URL. Only `http`, `https` and `file` are accepted.
    pub fn url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let parsed =
            Url::parse(&url).map_err(|e| Error::invalid_source(format!("URL[{url}]"), e))?;
        match parsed.scheme() {
            "http" | "https" | "file" => Ok(Self::Url(url)),
            other => Err(Error::invalid_source(
                format!("URL[{url}]"),
                format!("unsupported scheme {other}"),
            )),
        }
    }

    /// A local `.tar.gz`. The file must exist.
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let absolute = std::path::absolute(path)
            .map_err(|e| Error::invalid_source(format!("FILE[{}]", path.display()), e))?;
        if !absolute.is_file() {
            return Err(Error::invalid_source(
                format!("FILE[{}]", path.display()),
                "does not exist",
            ));
        }
        Ok(Self::File(absolute))
    }

    /// Resolves the URL the archive is fetched from.
    pub fn resolve_url(&self) -> Result<Url> {
        match self {
            Self::Version(version) => {
                let url = format!("{VERSION_DOWNLOAD_URL}/crate-{version}.tar.gz");
                Url::parse(&url).map_err(|e| Error::invalid_source(self.to_string(), e))
            }
            Self::Url(url) => Url::parse(url).map_err(|e| Error::invalid_source(self.to_string(), e)),
            Self::File(path) => Url::from_file_path(path).map_err(|()| {
                Error::invalid_source(self.to_string(), "path cannot be expressed as a file URL")
            }),
        }
    }

    /// Deterministic folder name for the extracted distribution.
    pub fn folder_name(&self) -> String {
        match self {
            Self::Version(version) => format!("crate-{version}"),
            Self::Url(url) => format!("crate-url-{}", sha256_hex(url)),
            Self::File(path) => format!("crate-file-{}", sha256_hex(&path.to_string_lossy())),
        }
    }

    /// Folder under `base_dir` the distribution is extracted into.
    pub fn cache_folder(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.folder_name())
    }

    /// File name of the archive, taken from the last URL path segment.
    pub fn archive_name(&self) -> String {
        let fallback = format!("{}.tar.gz", self.folder_name());
        match self.resolve_url() {
            Ok(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .filter(|name| !name.is_empty())
                .unwrap_or(fallback),
            Err(_) => fallback,
        }
    }

    /// Best guess at the server version behind this source.
    ///
    /// Exact for [`DownloadSource::Version`]. For URLs and files, a
    /// `crate-<x.y.z>.tar.gz` archive name is recognised.
    pub fn version_hint(&self) -> Option<CrateVersion> {
        match self {
            Self::Version(version) => CrateVersion::parse(version),
            Self::Url(_) | Self::File(_) => {
                let name = self.archive_name();
                let stem = name.strip_prefix("crate-")?;
                let stem = stem.strip_suffix(".tar.gz").unwrap_or(stem);
                CrateVersion::parse(stem)
            }
        }
    }

    /// Path of the archive on disk, when no download is needed.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self {
            Self::File(path) => Some(path.clone()),
            Self::Url(_) => self
                .resolve_url()
                .ok()
                .filter(|url| url.scheme() == "file")
                .and_then(|url| url.to_file_path().ok()),
            Self::Version(_) => None,
        }
    }
}

impl fmt::Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(version) => write!(f, "VERSION[{version}]"),
            Self::Url(url) => write!(f, "URL[{url}]"),
            Self::File(path) => write!(f, "FILE[{}]", path.display()),
        }
    }
}
