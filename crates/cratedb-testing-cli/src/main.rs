//! Command line front end for throwaway CrateDB clusters.
//!
//! # Quick Start
//!
//! ```bash
//! # Three nodes of a released version, until Ctrl+C
//! cratedb-testing start --from-version 4.8.1 --nodes 3
//!
//! # Same, configured through crate-testing.toml / CRATE_TESTING_*
//! CRATE_TESTING_FROM_VERSION=4.8.1 cratedb-testing start
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Start and stop ephemeral CrateDB clusters.
#[derive(Parser)]
#[command(name = "cratedb-testing")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster and keep it running until Ctrl+C.
    Start(StartArgs),

    /// Print the settings resolved from crate-testing.toml and the environment.
    Settings,
}

#[derive(clap::Args, Debug, Default)]
pub struct StartArgs {
    /// Released version to download, e.g. 4.8.1.
    #[arg(long, conflicts_with_all = ["from_url", "from_file"])]
    pub from_version: Option<String>,

    /// URL of a .tar.gz distribution.
    #[arg(long, conflicts_with = "from_file")]
    pub from_url: Option<String>,

    /// Local .tar.gz distribution.
    #[arg(long)]
    pub from_file: Option<PathBuf>,

    /// Number of nodes.
    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Cluster name.
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Root for downloads and working directories.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Node setting as key=value (repeatable).
    #[arg(short = 's', long = "setting", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,

    /// Keep the working directory after shutdown.
    #[arg(long)]
    pub keep: bool,

    /// Seconds to wait for all nodes to see each other.
    #[arg(long)]
    pub timeout: Option<u64>,
}

fn parse_setting(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => commands::start(args).await,
        Commands::Settings => commands::show_settings(),
    }
}
