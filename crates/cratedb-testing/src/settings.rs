//! Layered settings: built-in defaults, `crate-testing.toml`, then
//! `CRATE_TESTING_*` environment variables.

use crate::config::{ClusterSpec, ClusterSpecBuilder};
use crate::source::DownloadSource;
use crate::version::Settings;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-level settings file name.
pub const SETTINGS_FILE: &str = "crate-testing.toml";

/// Default environment variable prefix.
pub const ENV_PREFIX: &str = "CRATE_TESTING";

/// Cluster settings read from files and the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingSettings {
    /// Released version to download (`CRATE_TESTING_FROM_VERSION`).
    pub from_version: Option<String>,
    /// Archive URL (`CRATE_TESTING_FROM_URL`).
    pub from_url: Option<String>,
    /// Local archive (`CRATE_TESTING_FROM_FILE`).
    pub from_file: Option<PathBuf>,
    pub nodes: usize,
    pub cluster_name: Option<String>,
    pub host: Option<String>,
    pub root: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub keep_working_dir: bool,
    pub psql: Option<bool>,
    pub java8_home: Option<PathBuf>,
    pub readiness_timeout_secs: Option<u64>,
    /// Extra node settings; only settable from the file (`[settings]`).
    pub settings: Settings,
}

impl Default for TestingSettings {
    fn default() -> Self {
        Self {
            from_version: None,
            from_url: None,
            from_file: None,
            nodes: 1,
            cluster_name: None,
            host: None,
            root: None,
            cache_dir: None,
            keep_working_dir: false,
            psql: None,
            java8_home: None,
            readiness_timeout_secs: None,
            settings: Settings::new(),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl TestingSettings {
    /// Picks the source: version, then URL, then file.
    pub fn source(&self) -> Result<DownloadSource> {
        if let Some(version) = non_blank(&self.from_version) {
            return DownloadSource::version(version);
        }
        if let Some(url) = non_blank(&self.from_url) {
            return DownloadSource::url(url);
        }
        match &self.from_file {
            Some(path) if !path.as_os_str().is_empty() => DownloadSource::file(path),
            _ => Err(Error::Configuration(format!(
                "no download source configured (set {ENV_PREFIX}_FROM_VERSION, \
                 {ENV_PREFIX}_FROM_URL or {ENV_PREFIX}_FROM_FILE)"
            ))),
        }
    }

    /// Turns these settings into a spec builder.
    pub fn to_builder(&self) -> Result<ClusterSpecBuilder> {
        let mut builder = ClusterSpec::builder(self.source()?)
            .nodes(self.nodes)
            .keep_working_dir(self.keep_working_dir)
            .settings(self.settings.clone());

        if let Some(name) = non_blank(&self.cluster_name) {
            builder = builder.cluster_name(name);
        }
        if let Some(host) = non_blank(&self.host) {
            builder = builder.host(host);
        }
        if let Some(root) = &self.root {
            builder = builder.root(root);
        }
        if let Some(dir) = &self.cache_dir {
            builder = builder.cache_dir(dir);
        }
        if let Some(psql) = self.psql {
            builder = builder.psql(psql);
        }
        if let Some(home) = &self.java8_home {
            builder = builder.java8_home(home);
        }
        if let Some(secs) = self.readiness_timeout_secs {
            builder = builder.readiness_timeout(Duration::from_secs(secs));
        }
        Ok(builder)
    }
}

impl ClusterSpec {
    /// Configures a cluster from `crate-testing.toml` and `CRATE_TESTING_*`.
    pub fn from_settings() -> Result<ClusterSpecBuilder> {
        SettingsLoader::new().load()?.to_builder()
    }
}

/// Loads [`TestingSettings`] from every source with proper precedence.
pub struct SettingsLoader {
    project_dir: PathBuf,
    env_prefix: String,
    env: Option<config::Map<String, String>>,
}

impl SettingsLoader {
    /// Loader for the current directory and the process environment.
    pub fn new() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: ENV_PREFIX.to_string(),
            env: None,
        }
    }

    /// Directory searched for `crate-testing.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: `CRATE_TESTING`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Reads variables from `vars` instead of the process environment.
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn load(self) -> Result<TestingSettings> {
        let mut builder = config::Config::builder();

        let project_file = self.project_dir.join(SETTINGS_FILE);
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // No try_parsing: a version such as `4.0` must stay a string.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix).source(self.env),
        );

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::Configuration(format!("failed to load settings: {e}")))
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
