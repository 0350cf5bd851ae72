//! Ephemeral CrateDB clusters for integration tests.
//!
//! Provides the whole lifecycle of a throwaway cluster:
//! - Acquisition of a distribution by version, URL or local archive, cached on disk
//! - Free port allocation and per-node working copies
//! - Version-aware settings and command line rendering
//! - Process supervision with readiness polling and rollback on failure
//!
//! ```no_run
//! # async fn run() -> cratedb_testing::Result<()> {
//! use cratedb_testing::{ClusterSpec, TestCluster};
//! use std::time::Duration;
//!
//! let spec = ClusterSpec::from_version("4.8.1")?.nodes(2).build()?;
//! let mut cluster = TestCluster::start(spec, Duration::from_secs(60)).await?;
//! for node in cluster.nodes() {
//!     println!("{}", node.http_url());
//! }
//! cluster.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod ports;
pub mod probe;
pub mod settings;
pub mod source;
pub mod supervisor;
pub mod version;

pub use cache::{Artifact, ArtifactCache};
pub use crate::config::{ClusterSpec, ClusterSpecBuilder, ClusterTopology, NodeConfig, NodePorts};
pub use error::{DownloadErrorKind, Error, NodeDiagnostic, Result};
pub use node::{NodeProcess, NodeStatus};
pub use probe::{HttpProbe, ProbeError, ProbeTarget, ReadinessProbe};
pub use settings::{SettingsLoader, TestingSettings};
pub use source::DownloadSource;
pub use supervisor::{NodeInfo, TestCluster};
pub use version::CrateVersion;

/// Starts a cluster configured from `crate-testing.toml` and `CRATE_TESTING_*`.
pub async fn start_cluster() -> Result<TestCluster> {
    let spec = ClusterSpec::from_settings()?.build()?;
    let timeout = spec.readiness_timeout;
    TestCluster::start(spec, timeout).await
}

/// Stops a running cluster gracefully.
pub async fn stop_cluster(cluster: &mut TestCluster) {
    cluster.stop().await;
}
