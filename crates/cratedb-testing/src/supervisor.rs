//! Cluster lifecycle: build, start, wait for readiness, stop.

use crate::cache::ArtifactCache;
use crate::config::socket_address;
use crate::error::NodeDiagnostic;
use crate::probe::{HttpProbe, ProbeTarget, ReadinessProbe};
use crate::{ClusterSpec, ClusterTopology, Error, NodeConfig, NodeProcess, NodeStatus, Result};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Increment of the delay between readiness probes.
pub const POLL_STEP: Duration = Duration::from_millis(100);

/// Upper bound of the delay between readiness probes.
pub const POLL_CAP: Duration = Duration::from_secs(1);

/// Delay after the `attempt`-th failed probe (1-based).
pub fn backoff(attempt: u32) -> Duration {
    POLL_STEP.saturating_mul(attempt).min(POLL_CAP)
}

/// Connection details of one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: usize,
    pub host: String,
    pub http_port: u16,
    pub transport_port: u16,
    pub psql_port: Option<u16>,
}

impl NodeInfo {
    /// `http://host:http_port`.
    pub fn http_url(&self) -> String {
        format!("http://{}", socket_address(&self.host, self.http_port))
    }
}

impl From<&NodeConfig> for NodeInfo {
    fn from(config: &NodeConfig) -> Self {
        Self {
            id: config.id,
            host: config.host.clone(),
            http_port: config.ports.http,
            transport_port: config.ports.transport,
            psql_port: config.ports.psql,
        }
    }
}

/// An ephemeral CrateDB cluster.
///
/// The value owns every child process and the run's working tree. Both are
/// released by [`TestCluster::stop`], or on drop if `stop` was never awaited.
pub struct TestCluster {
    spec: ClusterSpec,
    topology: ClusterTopology,
    nodes: Vec<NodeProcess>,
    cache: ArtifactCache,
    stopped: bool,
}

impl TestCluster {
    /// Allocates ports and lays out nodes. Nothing is downloaded or spawned.
    pub fn build(spec: ClusterSpec) -> Result<Self> {
        spec.validate()?;
        let topology = ClusterTopology::allocate(&spec)?;
        let nodes = topology
            .nodes
            .iter()
            .cloned()
            .map(NodeProcess::new)
            .collect();
        let cache = ArtifactCache::new(spec.downloads_dir());

        debug!(
            source = %spec.source,
            nodes = spec.node_count,
            run_dir = %spec.run_dir().display(),
            "cluster built"
        );
        Ok(Self {
            spec,
            topology,
            nodes,
            cache,
            stopped: false,
        })
    }

    /// Builds and starts a cluster, probing readiness over HTTP.
    pub async fn start(spec: ClusterSpec, readiness_timeout: Duration) -> Result<Self> {
        let mut cluster = Self::build(spec)?;
        cluster.launch(&HttpProbe::new(), readiness_timeout).await?;
        Ok(cluster)
    }

    /// Starts every node and waits until each sees all members.
    ///
    /// On any failure every started node is stopped and the working tree is
    /// removed (unless kept) before the original error is returned. A
    /// cluster that failed to launch, or was stopped, may be launched again.
    pub async fn launch<P: ReadinessProbe>(
        &mut self,
        probe: &P,
        readiness_timeout: Duration,
    ) -> Result<()> {
        if let Some(node) = self
            .nodes
            .iter()
            .find(|node| matches!(node.status, NodeStatus::Running | NodeStatus::Ready))
        {
            return Err(Error::Configuration(format!(
                "cluster {} is already running (node {})",
                self.spec.cluster_name,
                node.id()
            )));
        }
        self.stopped = false;

        info!(
            cluster = %self.spec.cluster_name,
            nodes = self.nodes.len(),
            version = %self.spec.effective_version(),
            "starting cluster"
        );

        if let Err(e) = self.start_nodes().await {
            warn!(error = %e, "cluster start failed, rolling back");
            self.rollback().await;
            return Err(e);
        }

        if let Err(e) = self.wait_until_ready(probe, readiness_timeout).await {
            warn!(error = %e, "cluster never became ready, rolling back");
            self.rollback().await;
            return Err(e);
        }

        for node in &mut self.nodes {
            node.mark_ready();
        }
        info!(cluster = %self.spec.cluster_name, "cluster ready");
        Ok(())
    }

    async fn start_nodes(&mut self) -> Result<()> {
        let artifact = self.cache.ensure(&self.spec.source).await?;
        tokio::fs::create_dir_all(self.spec.run_dir()).await?;

        for node in &mut self.nodes {
            node.prepare(&artifact).await?;
            node.start().await?;
            info!(node = node.id(), port = node.port(), "node started");
        }
        Ok(())
    }

    async fn wait_until_ready<P: ReadinessProbe>(
        &mut self,
        probe: &P,
        limit: Duration,
    ) -> Result<()> {
        let expected = self.nodes.len();
        let mut diagnostics: Vec<NodeDiagnostic> = self
            .nodes
            .iter()
            .map(|node| NodeDiagnostic {
                node: node.id(),
                address: node.config.http_address(),
                last_visible: None,
                last_error: None,
                alive: true,
            })
            .collect();

        let outcome = timeout(
            limit,
            poll_readiness(&mut self.nodes, probe, &mut diagnostics),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                for (diagnostic, node) in diagnostics.iter_mut().zip(self.nodes.iter_mut()) {
                    diagnostic.alive = node.is_running();
                }
                Err(Error::ReadinessTimeout {
                    expected,
                    timeout: limit,
                    diagnostics,
                })
            }
        }
    }

    async fn rollback(&mut self) {
        self.shutdown_nodes().await;
        self.remove_working_dir();
        self.stopped = true;
    }

    /// Stops all nodes concurrently so grace periods overlap.
    async fn shutdown_nodes(&mut self) {
        join_all(self.nodes.iter_mut().map(|node| async move {
            if let Err(e) = node.stop().await {
                warn!(node = node.id(), error = %e, "failed to stop node");
            }
        }))
        .await;
    }

    fn remove_working_dir(&self) {
        let run_dir = self.spec.run_dir();
        if self.spec.keep_working_dir {
            info!(path = %run_dir.display(), "keeping working directory");
            return;
        }
        match std::fs::remove_dir_all(&run_dir) {
            Ok(()) => debug!(path = %run_dir.display(), "working directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = Error::Teardown {
                    path: run_dir,
                    reason: e.to_string(),
                };
                warn!(error = %err, "cleanup failed");
            }
        }
    }

    /// Stops every node and removes the working tree unless kept.
    ///
    /// Failures are logged, never returned. Calling it twice is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        info!(cluster = %self.spec.cluster_name, "stopping cluster");
        self.shutdown_nodes().await;
        self.remove_working_dir();
        self.stopped = true;
    }

    /// Connection details of every member, in node order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.topology.nodes.iter().map(NodeInfo::from).collect()
    }

    /// Connection details of a randomly chosen member.
    pub fn random_node(&self) -> Option<NodeInfo> {
        self.topology
            .nodes
            .choose(&mut rand::thread_rng())
            .map(NodeInfo::from)
    }

    /// `http://host:port` of node `id`.
    pub fn http_url(&self, id: usize) -> Option<String> {
        self.topology
            .get_node(id)
            .map(|config| NodeInfo::from(config).http_url())
    }

    /// Root of this run's node directories.
    pub fn working_dir(&self) -> PathBuf {
        self.spec.run_dir()
    }

    /// Directory node `id` runs in.
    pub fn node_dir(&self, id: usize) -> Option<&Path> {
        self.topology
            .get_node(id)
            .map(|config| config.working_dir.as_path())
    }

    /// Returns the status of all nodes.
    pub fn status(&mut self) -> Vec<(usize, NodeStatus, u16)> {
        self.nodes
            .iter_mut()
            .map(|node| {
                if matches!(node.status, NodeStatus::Running | NodeStatus::Ready)
                    && !node.is_running()
                {
                    node.mark_failed();
                }
                (node.id(), node.status, node.port())
            })
            .collect()
    }

    /// Returns the number of live nodes.
    pub fn running_count(&mut self) -> usize {
        self.status()
            .iter()
            .filter(|(_, status, _)| matches!(status, NodeStatus::Running | NodeStatus::Ready))
            .count()
    }

    /// Returns the cluster specification.
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        debug!(cluster = %self.spec.cluster_name, "cluster dropped without stop");
        for node in &mut self.nodes {
            node.kill_now();
        }
        self.remove_working_dir();
    }
}

/// Probes members round-robin until one reports every node.
async fn poll_readiness<P: ReadinessProbe>(
    nodes: &mut [NodeProcess],
    probe: &P,
    diagnostics: &mut [NodeDiagnostic],
) -> Result<()> {
    let expected = nodes.len();
    let mut attempt: u32 = 0;

    loop {
        for node in nodes.iter_mut() {
            if let Some(status) = node.exit_status() {
                node.mark_failed();
                return Err(Error::ProcessStart {
                    node: node.id(),
                    reason: format!("process exited while waiting for the cluster ({status})"),
                });
            }
        }

        let index = attempt as usize % expected;
        let target = ProbeTarget {
            node: nodes[index].id(),
            host: nodes[index].config.host.clone(),
            http_port: nodes[index].port(),
        };
        match probe.visible_nodes(&target).await {
            Ok(visible) => {
                debug!(node = target.node, visible, expected, "readiness probe");
                diagnostics[index].last_visible = Some(visible);
                diagnostics[index].last_error = None;
                if visible == expected {
                    return Ok(());
                }
            }
            Err(e) => {
                debug!(node = target.node, error = %e, "readiness probe failed");
                diagnostics[index].last_error = Some(e.to_string());
            }
        }

        attempt = attempt.saturating_add(1);
        sleep(backoff(attempt)).await;
    }
}
