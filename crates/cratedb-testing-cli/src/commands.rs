//! Cluster commands.

use crate::StartArgs;
use anyhow::{Context, Result};
use cratedb_testing::{NodeInfo, SettingsLoader, TestCluster, TestingSettings};
use tracing::info;

/// One line per node, stable for scripts: `NODE=host:http:transport[:psql]`.
pub fn node_line(node: &NodeInfo) -> String {
    let mut line = format!("NODE={}:{}:{}", node.host, node.http_port, node.transport_port);
    if let Some(psql) = node.psql_port {
        line.push_str(&format!(":{psql}"));
    }
    line
}

/// Applies command line flags over the loaded settings.
pub fn merge(mut settings: TestingSettings, args: StartArgs) -> TestingSettings {
    if args.from_version.is_some() || args.from_url.is_some() || args.from_file.is_some() {
        settings.from_version = args.from_version;
        settings.from_url = args.from_url;
        settings.from_file = args.from_file;
    }
    if let Some(nodes) = args.nodes {
        settings.nodes = nodes;
    }
    if args.cluster_name.is_some() {
        settings.cluster_name = args.cluster_name;
    }
    if args.root.is_some() {
        settings.root = args.root;
    }
    if args.keep {
        settings.keep_working_dir = true;
    }
    if args.timeout.is_some() {
        settings.readiness_timeout_secs = args.timeout;
    }
    settings.settings.extend(args.settings);
    settings
}

/// Start a cluster, print its nodes and wait for Ctrl+C.
pub async fn start(args: StartArgs) -> Result<()> {
    let loaded = SettingsLoader::new()
        .load()
        .context("Failed to load settings")?;
    let spec = merge(loaded, args)
        .to_builder()
        .and_then(cratedb_testing::ClusterSpecBuilder::build)
        .context("Invalid cluster configuration")?;
    let timeout = spec.readiness_timeout;

    let mut cluster = TestCluster::start(spec, timeout)
        .await
        .context("Failed to start cluster")?;

    for node in cluster.nodes() {
        println!("{}", node_line(&node));
    }
    info!(
        working_dir = %cluster.working_dir().display(),
        "cluster running, press Ctrl+C to stop"
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("shutting down cluster");
    cluster.stop().await;
    signal.context("Failed to listen for Ctrl+C")
}

/// Print the resolved settings as JSON.
pub fn show_settings() -> Result<()> {
    let settings = SettingsLoader::new()
        .load()
        .context("Failed to load settings")?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
