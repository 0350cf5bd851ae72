//! Error types for test cluster management.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which stage of artifact acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// Fetching the archive over the network failed.
    Network,
    /// Writing or moving files on the local disk failed.
    Io,
    /// The archive could not be decompressed or unpacked.
    CorruptArchive,
}

impl fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Io => "io",
            Self::CorruptArchive => "corrupt archive",
        };
        f.write_str(name)
    }
}

/// What a single node reported during the last readiness attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiagnostic {
    /// Node index within the cluster.
    pub node: usize,
    /// `host:http_port` the probe was sent to.
    pub address: String,
    /// Last node count this node reported, if it ever answered.
    pub last_visible: Option<usize>,
    /// Last probe error, if the most recent attempt failed.
    pub last_error: Option<String>,
    /// Whether the process was still alive when the wait gave up.
    pub alive: bool,
}

impl fmt::Display for NodeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({})", self.node, self.address)?;
        match (self.last_visible, &self.last_error) {
            (Some(count), _) => write!(f, " saw {count} node(s)")?,
            (None, Some(err)) => write!(f, " never answered: {err}")?,
            (None, None) => write!(f, " was never probed")?,
        }
        if !self.alive {
            write!(f, ", process exited")?;
        }
        Ok(())
    }
}

fn join_diagnostics(diagnostics: &[NodeDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Test cluster errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The cluster specification is invalid. Raised before any resource is acquired.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The download source is malformed for its variant.
    #[error("Invalid download source {source_ref}: {reason}")]
    InvalidSource { source_ref: String, reason: String },

    /// Fetching or extracting an artifact failed.
    #[error("Download of {source_ref} failed ({kind}): {reason}")]
    Download {
        kind: DownloadErrorKind,
        source_ref: String,
        reason: String,
    },

    /// A node process could not be spawned or died right away.
    #[error("Node {node} failed to start: {reason}")]
    ProcessStart { node: usize, reason: String },

    /// All nodes were spawned but the cluster never became fully visible.
    #[error(
        "Cluster did not report {expected} node(s) within {timeout:?}: {}",
        join_diagnostics(.diagnostics)
    )]
    ReadinessTimeout {
        expected: usize,
        timeout: Duration,
        diagnostics: Vec<NodeDiagnostic>,
    },

    /// No bindable port could be found.
    #[error("No free port found in range {low}..={high} after {attempts} attempts")]
    NoFreePort { low: u16, high: u16, attempts: usize },

    /// Best-effort cleanup failed. Only ever logged.
    #[error("Teardown of {path} failed: {reason}")]
    Teardown { path: PathBuf, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn download(
        kind: DownloadErrorKind,
        source_ref: impl fmt::Display,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Download {
            kind,
            source_ref: source_ref.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_source(source_ref: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidSource {
            source_ref: source_ref.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the index of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<usize> {
        match self {
            Self::ProcessStart { node, .. } => Some(*node),
            _ => None,
        }
    }
}

/// Result type for test cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
