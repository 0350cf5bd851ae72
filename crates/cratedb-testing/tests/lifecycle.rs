//! End-to-end cluster lifecycle against a fake distribution.
//!
//! The archive ships a shell `bin/crate` that records its arguments and pid,
//! then sleeps until terminated.

#![cfg(unix)]

use cratedb_testing::node::STOP_GRACE;
use cratedb_testing::probe::ProbeError;
use cratedb_testing::{
    ClusterSpec, Error, HttpProbe, NodeStatus, ProbeTarget, ReadinessProbe, TestCluster,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SLEEPING_LAUNCHER: &str = "#!/bin/sh
echo $$ > pid
for arg in \"$@\"; do echo \"$arg\"; done > args
exec sleep 600
";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("cratedb_testing=debug")
        .try_init();
}

fn write_distribution(path: &Path, launcher: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
    for (name, data, mode) in [
        ("crate-4.0.0/bin/crate", launcher.as_bytes(), 0o644),
        ("crate-4.0.0/config/crate.yml", b"# empty\n".as_slice(), 0o644),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

fn distribution(temp: &TempDir, launcher: &str) -> PathBuf {
    let archive = temp.path().join("crate-4.0.0.tar.gz");
    write_distribution(&archive, launcher);
    archive
}

/// Answers the `_sql` node count query with `count` on `port`.
async fn serve_node_count(port: u16, count: usize) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            read_request(&mut stream).await;
            let body = format!(r#"{{"cols":["nodes"],"rows":[[{count}]],"rowcount":1}}"#);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
}

async fn read_request(stream: &mut TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            return;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return;
            }
        }
    }
}

/// Never sees the whole cluster.
struct LonelyProbe;

impl ReadinessProbe for LonelyProbe {
    async fn visible_nodes(&self, _: &ProbeTarget) -> Result<usize, ProbeError> {
        Ok(0)
    }
}

/// Always reports the same node count.
struct FixedProbe(usize);

impl ReadinessProbe for FixedProbe {
    async fn visible_nodes(&self, _: &ProbeTarget) -> Result<usize, ProbeError> {
        Ok(self.0)
    }
}

fn process_alive(pid: &str) -> bool {
    Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .is_ok_and(|status| status.success())
}

#[tokio::test]
async fn test_single_node_lifecycle() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .cluster_name("e2e")
        .setting("stats.enabled", false)
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();
    let node = cluster.nodes().remove(0);
    serve_node_count(node.http_port, 1).await;

    cluster
        .launch(&HttpProbe::new(), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(cluster.nodes().len(), 1);
    assert_eq!(cluster.status(), vec![(0, NodeStatus::Ready, node.http_port)]);
    assert_eq!(cluster.running_count(), 1);

    let node_dir = cluster.node_dir(0).unwrap().to_path_buf();
    let args = std::fs::read_to_string(node_dir.join("args")).unwrap();
    assert!(args.lines().any(|a| a == format!("-Chttp.port={}", node.http_port)));
    assert!(args.lines().any(|a| a == "-Ccluster.name=e2e"));
    assert!(args.lines().any(|a| a == "-Cstats.enabled=false"));
    assert!(args.lines().any(|a| a.starts_with("-Cdiscovery.seed_hosts=127.0.0.1:")));

    let working_dir = cluster.working_dir();
    assert!(working_dir.is_dir());
    assert!(temp.path().join("root/downloads").is_dir());

    cluster.stop().await;
    assert!(!working_dir.exists());
    assert_eq!(cluster.running_count(), 0);
    // The extracted distribution stays cached.
    assert!(temp.path().join("root/downloads").read_dir().unwrap().next().is_some());
}

#[tokio::test]
async fn test_keep_working_dir() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .root(temp.path().join("root"))
        .keep_working_dir(true)
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();
    serve_node_count(cluster.nodes()[0].http_port, 1).await;

    cluster
        .launch(&HttpProbe::new(), Duration::from_secs(10))
        .await
        .unwrap();
    let pid = std::fs::read_to_string(cluster.node_dir(0).unwrap().join("pid")).unwrap();
    assert!(process_alive(&pid));

    cluster.stop().await;
    assert!(cluster.working_dir().join("node-0/bin/crate").is_file());
    assert!(!process_alive(&pid));
}

#[tokio::test]
async fn test_failing_node_rolls_back_started_nodes() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .nodes(3)
        .root(temp.path().join("root"))
        .keep_working_dir(true)
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();

    // Node 1 refuses to start once its port shows up on the command line.
    let failing_port = cluster.nodes()[1].http_port;
    let launcher = format!(
        "#!/bin/sh
for arg in \"$@\"; do
  case \"$arg\" in
    *http.port={failing_port}) echo 'address already in use' >&2; exit 1 ;;
  esac
done
echo $$ > pid
exec sleep 600
"
    );
    write_distribution(&archive, &launcher);

    let err = cluster
        .launch(&LonelyProbe, Duration::from_secs(10))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProcessStart { node: 1, .. }), "{err}");
    assert_eq!(err.node(), Some(1));

    let first_pid = std::fs::read_to_string(cluster.node_dir(0).unwrap().join("pid")).unwrap();
    assert!(!process_alive(&first_pid));
    assert!(!cluster.node_dir(2).unwrap().exists());
    assert_eq!(cluster.running_count(), 0);
}

#[tokio::test]
async fn test_node_dying_while_waiting_aborts_start() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, "#!/bin/sh\nsleep 1\nexit 7\n");

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();

    let err = cluster
        .launch(&LonelyProbe, Duration::from_secs(20))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProcessStart { node: 0, .. }), "{err}");
    assert!(err.to_string().contains("while waiting"));
    assert!(!cluster.working_dir().exists());
}

#[tokio::test]
async fn test_readiness_timeout_rolls_back() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .nodes(2)
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();

    let err = cluster
        .launch(&LonelyProbe, Duration::from_millis(800))
        .await
        .unwrap_err();

    match err {
        Error::ReadinessTimeout { expected, diagnostics, .. } => {
            assert_eq!(expected, 2);
            assert!(diagnostics.iter().all(|d| d.alive && d.last_visible == Some(0)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!cluster.working_dir().exists());
    assert_eq!(cluster.running_count(), 0);
}

#[tokio::test]
async fn test_relaunch_after_failure_is_stopped_cleanly() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();

    let first = cluster.launch(&LonelyProbe, Duration::from_millis(500)).await;
    assert!(matches!(first, Err(Error::ReadinessTimeout { .. })));

    cluster
        .launch(&FixedProbe(1), Duration::from_secs(10))
        .await
        .unwrap();
    let pid = std::fs::read_to_string(cluster.node_dir(0).unwrap().join("pid")).unwrap();
    assert!(process_alive(&pid));

    cluster.stop().await;
    assert!(!process_alive(&pid));
    assert!(!cluster.working_dir().exists());
}

#[tokio::test]
async fn test_launch_refused_while_running() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let archive = distribution(&temp, SLEEPING_LAUNCHER);

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();
    cluster
        .launch(&FixedProbe(1), Duration::from_secs(10))
        .await
        .unwrap();

    let again = cluster.launch(&FixedProbe(1), Duration::from_secs(10)).await;
    assert!(matches!(again, Err(Error::Configuration(_))));
    assert_eq!(cluster.running_count(), 1);

    cluster.stop().await;
    assert!(!cluster.working_dir().exists());
}

#[tokio::test]
async fn test_stop_overlaps_grace_periods() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    // Ignores SIGTERM, so every node runs into the grace period.
    let archive = distribution(
        &temp,
        "#!/bin/sh\ntrap '' TERM\necho $$ > pid\nexec sleep 600\n",
    );

    let spec = ClusterSpec::from_file(&archive)
        .unwrap()
        .nodes(3)
        .root(temp.path().join("root"))
        .build()
        .unwrap();
    let mut cluster = TestCluster::build(spec).unwrap();
    cluster
        .launch(&FixedProbe(3), Duration::from_secs(10))
        .await
        .unwrap();

    let started = Instant::now();
    cluster.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed < STOP_GRACE * 2, "{elapsed:?}");
    assert_eq!(cluster.running_count(), 0);
    assert!(!cluster.working_dir().exists());
}
