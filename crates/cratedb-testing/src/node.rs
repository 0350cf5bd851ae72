//! Node process management.

use crate::cache::{Artifact, prepare_working_copy};
use crate::error::DownloadErrorKind;
use crate::version::render_flags;
use crate::{Error, NodeConfig, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// How long a freshly spawned process must survive to count as started.
pub const START_SETTLE: Duration = Duration::from_millis(200);

/// How long a terminated process may take to exit before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Launcher script relative to the distribution root.
#[cfg(windows)]
pub const LAUNCHER: &str = "bin/crate.bat";
#[cfg(not(windows))]
pub const LAUNCHER: &str = "bin/crate";

/// Lifecycle of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Configured, nothing on disk yet.
    Created,

    /// Distribution copied into the working directory.
    Extracted,

    /// Process spawned.
    Running,

    /// Part of a cluster that reported all members.
    Ready,

    /// Failed to start or exited unexpectedly.
    Failed,

    /// Stopped by the orchestrator.
    Stopped,
}

/// A managed CrateDB node process.
pub struct NodeProcess {
    /// Node configuration.
    pub config: NodeConfig,

    /// Current status.
    pub status: NodeStatus,

    process: Option<Child>,
    drains: Vec<JoinHandle<()>>,
}

impl NodeProcess {
    /// Creates a new node process (not started).
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            status: NodeStatus::Created,
            process: None,
            drains: Vec::new(),
        }
    }

    /// Copies the distribution into this node's working directory.
    /// The copy runs on the blocking pool.
    pub async fn prepare(&mut self, artifact: &Artifact) -> Result<()> {
        let dest = self.config.working_dir.clone();
        if !dest.join(LAUNCHER).exists() {
            debug!(node = self.id(), dest = %dest.display(), "preparing working copy");
            let source_ref = artifact.root.display().to_string();
            let artifact = artifact.clone();
            tokio::task::spawn_blocking(move || prepare_working_copy(&artifact, &dest))
                .await
                .map_err(|e| Error::download(DownloadErrorKind::Io, &source_ref, e))?
                .map_err(|e| Error::download(DownloadErrorKind::Io, &source_ref, e))?;
        }
        self.status = NodeStatus::Extracted;
        Ok(())
    }

    /// Path of the launcher under the node's working directory.
    pub fn launcher(&self) -> PathBuf {
        self.config.working_dir.join(LAUNCHER)
    }

    /// Rendered settings followed by the caller's raw arguments.
    pub fn arguments(&self) -> Vec<String> {
        let surface = self.config.launch_surface();
        let mut args = render_flags(&surface);
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Starts the node process.
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.status, NodeStatus::Running | NodeStatus::Ready) {
            return Err(Error::ProcessStart {
                node: self.id(),
                reason: "already running".to_string(),
            });
        }

        let launcher = self.launcher();
        if !launcher.is_file() {
            self.status = NodeStatus::Failed;
            return Err(Error::ProcessStart {
                node: self.id(),
                reason: format!("launcher not found at {}", launcher.display()),
            });
        }

        let surface = self.config.launch_surface();
        let args = self.arguments();
        info!(
            node = self.id(),
            version = %self.config.version,
            ports = %self.config.ports,
            "starting crate process"
        );
        debug!(node = self.id(), ?args, "command line");

        let mut child = Command::new(&launcher)
            .args(&args)
            .envs(&surface.env)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.status = NodeStatus::Failed;
                Error::ProcessStart {
                    node: self.config.id,
                    reason: format!("failed to spawn {}: {e}", launcher.display()),
                }
            })?;

        if let Some(stdout) = child.stdout.take() {
            self.drains.push(drain(self.id(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            self.drains.push(drain(self.id(), "stderr", stderr));
        }
        self.process = Some(child);
        self.status = NodeStatus::Running;

        // Give it a moment to start
        sleep(START_SETTLE).await;

        if let Some(status) = self.exit_status() {
            self.status = NodeStatus::Failed;
            self.process = None;
            return Err(Error::ProcessStart {
                node: self.id(),
                reason: format!("process exited immediately ({status})"),
            });
        }
        Ok(())
    }

    /// Stops the node process. Stopping a stopped or exited node succeeds.
    pub async fn stop(&mut self) -> Result<()> {
        let result = match self.process.take() {
            Some(mut child) => shutdown(self.config.id, &mut child).await,
            None => Ok(()),
        };
        for drain in self.drains.drain(..) {
            drain.abort();
        }
        self.status = NodeStatus::Stopped;
        result
    }

    /// Checks if the node process is alive.
    pub fn is_running(&mut self) -> bool {
        if let Some(child) = &mut self.process {
            matches!(child.try_wait(), Ok(None))
        } else {
            false
        }
    }

    /// Exit status if the process was started and has since exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.process
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// OS process id while the process runs.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Records that the cluster saw every member.
    pub fn mark_ready(&mut self) {
        if self.status == NodeStatus::Running {
            self.status = NodeStatus::Ready;
        }
    }

    /// Records that the process died underneath us.
    pub fn mark_failed(&mut self) {
        self.status = NodeStatus::Failed;
    }

    /// Sends a kill without waiting. Used where awaiting is impossible.
    pub fn kill_now(&mut self) {
        if let Some(child) = &mut self.process {
            if let Err(e) = child.start_kill() {
                debug!(node = self.config.id, error = %e, "kill failed");
            }
        }
        for drain in self.drains.drain(..) {
            drain.abort();
        }
    }

    /// Returns the node ID.
    pub fn id(&self) -> usize {
        self.config.id
    }

    /// Returns the HTTP port.
    pub fn port(&self) -> u16 {
        self.config.ports.http
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        self.kill_now();
    }
}

fn drain<R>(node: usize, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "cratedb_testing::server", node, stream, "{line}");
        }
    })
}

async fn shutdown(node: usize, child: &mut Child) -> Result<()> {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(node, %status, "process had already exited");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) => return Err(Error::Io(e)),
    }

    terminate(node, child).await;

    match timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!(node, %status, "crate process stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => {
            warn!(node, "process ignored terminate, killing");
            // kill() treats an already exited child as success.
            child.kill().await.map_err(Error::Io)
        }
    }
}

/// Asks the process to exit gracefully.
#[cfg(unix)]
async fn terminate(node: usize, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let sent = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success());
    if !sent {
        debug!(node, pid, "SIGTERM not delivered, falling back to kill");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
async fn terminate(_node: usize, child: &mut Child) {
    let _ = child.start_kill();
}
