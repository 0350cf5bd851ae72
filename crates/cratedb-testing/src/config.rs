//! Cluster specification and per-node configuration.

use crate::source::DownloadSource;
use crate::version::{CrateVersion, LaunchSurface, RegimeContext, Settings, launch_surface};
use crate::{Error, Result, ports};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Default cluster name, shared by every node.
pub const DEFAULT_CLUSTER_NAME: &str = "TestingCluster";

/// Default time to wait for all nodes to see each other.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// `<system temp>/crate.testing`, the default root for downloads and working dirs.
pub fn default_root() -> PathBuf {
    std::env::temp_dir().join("crate.testing")
}

/// Everything needed to bring up one test cluster.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    /// Where the distribution comes from.
    pub source: DownloadSource,
    /// Name every node joins.
    pub cluster_name: String,
    /// Number of nodes (>= 1).
    pub node_count: usize,
    /// Caller settings, applied over the defaults.
    pub settings: Settings,
    /// Address nodes bind and advertise.
    pub host: String,
    /// Root holding `working/` (and `downloads/` unless `cache_dir` is set).
    pub root: PathBuf,
    /// Explicit download cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Leave the working directory in place after stop.
    pub keep_working_dir: bool,
    /// Unique per run; isolates concurrent runs sharing `root`.
    pub run_id: Uuid,
    /// Raw arguments appended after the rendered settings.
    pub extra_args: Vec<String>,
    /// Allocate and configure a PostgreSQL wire protocol port.
    pub psql: bool,
    /// Overrides the version inferred from the source.
    pub version: Option<CrateVersion>,
    /// Java 8 installation for releases that predate newer JVM support.
    pub java8_home: Option<PathBuf>,
    /// Default readiness timeout.
    pub readiness_timeout: Duration,
}

impl ClusterSpec {
    /// Starts configuring a cluster for `source`.
    pub fn builder(source: DownloadSource) -> ClusterSpecBuilder {
        ClusterSpecBuilder::new(source)
    }

    /// Configures a cluster for a released version.
    pub fn from_version(version: &str) -> Result<ClusterSpecBuilder> {
        Ok(Self::builder(DownloadSource::version(version)?))
    }

    /// Configures a cluster for a download URL.
    pub fn from_url(url: &str) -> Result<ClusterSpecBuilder> {
        Ok(Self::builder(DownloadSource::url(url)?))
    }

    /// Configures a cluster for a local `.tar.gz`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<ClusterSpecBuilder> {
        Ok(Self::builder(DownloadSource::file(path)?))
    }

    /// Version whose configuration surface is used.
    pub fn effective_version(&self) -> CrateVersion {
        self.version
            .clone()
            .or_else(|| self.source.version_hint())
            .unwrap_or_else(CrateVersion::latest)
    }

    /// Download cache directory.
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.root.join("downloads"))
    }

    /// Working directory of this run: `<root>/working/<folder>_<run_id>`.
    pub fn run_dir(&self) -> PathBuf {
        self.root
            .join("working")
            .join(format!("{}_{}", self.source.folder_name(), self.run_id))
    }

    /// Address used to probe for free ports.
    pub fn bind_addr(&self) -> Result<IpAddr> {
        resolve_host(&self.host)
    }

    /// Checks the invariants [`ClusterSpecBuilder::build`] enforces.
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(Error::Configuration(format!(
                "invalid number of nodes: {}",
                self.node_count
            )));
        }
        validate_cluster_name(&self.cluster_name)?;
        resolve_host(&self.host)?;
        Ok(())
    }
}

/// `host:port`, with IPv6 literals in brackets.
pub fn socket_address(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::Configuration(format!("cannot resolve host {host}")))
}

fn validate_cluster_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "malformed cluster name {name:?} (use letters, digits, '-', '_' or '.')"
        )))
    }
}

/// Builder for [`ClusterSpec`].
#[derive(Debug, Clone)]
pub struct ClusterSpecBuilder {
    spec: ClusterSpec,
    psql_set: bool,
}

impl ClusterSpecBuilder {
    fn new(source: DownloadSource) -> Self {
        Self {
            spec: ClusterSpec {
                source,
                cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
                node_count: 1,
                settings: Settings::new(),
                host: Ipv4Addr::LOCALHOST.to_string(),
                root: default_root(),
                cache_dir: None,
                keep_working_dir: false,
                run_id: Uuid::new_v4(),
                extra_args: Vec::new(),
                psql: true,
                version: None,
                java8_home: None,
                readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            },
            psql_set: false,
        }
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.spec.cluster_name = name.into();
        self
    }

    pub fn nodes(mut self, count: usize) -> Self {
        self.spec.node_count = count;
        self
    }

    /// Adds one setting, e.g. `("stats.enabled", true)`.
    pub fn setting(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.spec.settings.insert(key.into(), value.to_string());
        self
    }

    /// Adds every setting in `settings`.
    pub fn settings<K, V>(mut self, settings: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        for (key, value) in settings {
            self.spec.settings.insert(key.into(), value.to_string());
        }
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.spec.host = host.into();
        self
    }

    /// Root directory for `downloads/` and `working/`.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.spec.root = root.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.cache_dir = Some(dir.into());
        self
    }

    pub fn keep_working_dir(mut self, keep: bool) -> Self {
        self.spec.keep_working_dir = keep;
        self
    }

    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.spec.run_id = run_id;
        self
    }

    /// Appends a raw argument (`-Dfoo=bar`, `--verbose`) to every node.
    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.extra_args.push(arg.into());
        self
    }

    pub fn psql(mut self, enabled: bool) -> Self {
        self.spec.psql = enabled;
        self.psql_set = true;
        self
    }

    /// Pins the configuration surface to `version`.
    pub fn version(mut self, version: CrateVersion) -> Self {
        self.spec.version = Some(version);
        self
    }

    pub fn java8_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.spec.java8_home = Some(home.into());
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.spec.readiness_timeout = timeout;
        self
    }

    /// Validates and returns the spec. No resources are acquired.
    pub fn build(mut self) -> Result<ClusterSpec> {
        self.spec.validate()?;
        if !self.psql_set {
            // The PostgreSQL protocol does not exist before 1.0.
            self.spec.psql = self.spec.effective_version() >= CrateVersion::from_static(&[1, 0, 0]);
        }
        Ok(self.spec)
    }
}

/// Ports of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePorts {
    pub http: u16,
    pub transport: u16,
    pub psql: Option<u16>,
}

/// Fully resolved configuration of one node. Immutable once built.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node index (0-based).
    pub id: usize,
    pub host: String,
    pub ports: NodePorts,
    pub cluster_name: String,
    /// Private copy of the distribution; the process runs here.
    pub working_dir: PathBuf,
    /// Caller settings applied over the version defaults.
    pub settings: Settings,
    pub extra_args: Vec<String>,
    pub version: CrateVersion,
    /// `host:transport_port` of every node, this one included.
    pub unicast_hosts: Vec<String>,
    pub java8_home: Option<PathBuf>,
}

impl NodeConfig {
    /// Settings every version needs: host, name and ports.
    pub fn core_settings(&self) -> Settings {
        let mut settings = Settings::new();
        settings.insert("network.host".to_string(), self.host.clone());
        settings.insert("cluster.name".to_string(), self.cluster_name.clone());
        settings.insert("http.port".to_string(), self.ports.http.to_string());
        settings.insert(
            "transport.tcp.port".to_string(),
            self.ports.transport.to_string(),
        );
        if let Some(psql) = self.ports.psql {
            settings.insert("psql.port".to_string(), psql.to_string());
            settings.insert("psql.enabled".to_string(), "true".to_string());
        }
        settings
    }

    /// Settings, flag prefix and environment for this node's version.
    pub fn launch_surface(&self) -> LaunchSurface {
        let ctx = RegimeContext {
            unicast_hosts: self.unicast_hosts.clone(),
            java8_home: self.java8_home.clone(),
        };
        launch_surface(&self.version, self.core_settings(), &self.settings, &ctx)
    }

    /// `host:http_port`.
    pub fn http_address(&self) -> String {
        socket_address(&self.host, self.ports.http)
    }
}

/// Node layout of one cluster.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    /// Node configurations, indexed by node id.
    pub nodes: Vec<NodeConfig>,
}

impl ClusterTopology {
    /// Allocates ports for every node and derives the shared peer list.
    pub fn allocate(spec: &ClusterSpec) -> Result<Self> {
        let per_node = if spec.psql { 3 } else { 2 };
        let ports = ports::allocate_distinct(spec.bind_addr()?, spec.node_count * per_node)?;
        let node_ports: Vec<NodePorts> = ports
            .chunks(per_node)
            .map(|chunk| NodePorts {
                http: chunk[0],
                transport: chunk[1],
                psql: chunk.get(2).copied(),
            })
            .collect();
        Ok(Self::with_ports(spec, &node_ports))
    }

    /// Builds the topology from already chosen ports.
    pub fn with_ports(spec: &ClusterSpec, node_ports: &[NodePorts]) -> Self {
        let unicast_hosts: Vec<String> = node_ports
            .iter()
            .map(|p| socket_address(&spec.host, p.transport))
            .collect();
        let version = spec.effective_version();
        let run_dir = spec.run_dir();

        let nodes = node_ports
            .iter()
            .enumerate()
            .map(|(id, ports)| NodeConfig {
                id,
                host: spec.host.clone(),
                ports: *ports,
                cluster_name: spec.cluster_name.clone(),
                working_dir: run_dir.join(format!("node-{id}")),
                settings: spec.settings.clone(),
                extra_args: spec.extra_args.clone(),
                version: version.clone(),
                unicast_hosts: unicast_hosts.clone(),
                java8_home: spec.java8_home.clone(),
            })
            .collect();
        Self { nodes }
    }

    /// Returns the configuration for a specific node.
    pub fn get_node(&self, id: usize) -> Option<&NodeConfig> {
        self.nodes.get(id)
    }
}

impl fmt::Display for NodePorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http={} transport={}", self.http, self.transport)?;
        if let Some(psql) = self.psql {
            write!(f, " psql={psql}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn spec(nodes: usize) -> ClusterSpec {
        ClusterSpec::from_version("4.0.0")
            .unwrap()
            .nodes(nodes)
            .root("/tmp/crate.testing-unit")
            .build()
            .unwrap()
    }

    #[test]
    fn test_no_nodes() {
        let err = ClusterSpec::from_version("0.52.0")
            .unwrap()
            .nodes(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("invalid number of nodes: 0"));
    }

    #[test]
    fn test_malformed_cluster_name() {
        for name in ["", "has space", "a,b"] {
            let result = ClusterSpec::from_version("4.0.0")
                .unwrap()
                .cluster_name(name)
                .build();
            assert!(matches!(result, Err(Error::Configuration(_))), "{name:?}");
        }
    }

    #[test]
    fn test_defaults() {
        let spec = ClusterSpec::from_version("4.0.0").unwrap().build().unwrap();
        assert_eq!(spec.cluster_name, DEFAULT_CLUSTER_NAME);
        assert_eq!(spec.node_count, 1);
        assert_eq!(spec.host, "127.0.0.1");
        assert!(!spec.keep_working_dir);
        assert!(spec.psql);
        assert_eq!(spec.downloads_dir(), default_root().join("downloads"));
    }

    #[test]
    fn test_psql_defaults_off_before_1_0() {
        let spec = ClusterSpec::from_version("0.57.0").unwrap().build().unwrap();
        assert!(!spec.psql);

        let forced = ClusterSpec::from_version("0.57.0")
            .unwrap()
            .psql(true)
            .build()
            .unwrap();
        assert!(forced.psql);
    }

    #[test]
    fn test_run_dir_is_scoped_by_run_id() {
        let a = spec(1);
        let b = spec(1);
        assert_ne!(a.run_dir(), b.run_dir());
        assert!(a.run_dir().starts_with("/tmp/crate.testing-unit/working"));
        assert!(
            a.run_dir()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("crate-4.0.0_")
        );
    }

    #[test]
    fn test_allocate_topology() {
        let spec = spec(3);
        let topology = ClusterTopology::allocate(&spec).unwrap();

        assert_eq!(topology.nodes.len(), 3);
        let mut all_ports = HashSet::new();
        for node in &topology.nodes {
            assert!(all_ports.insert(node.ports.http));
            assert!(all_ports.insert(node.ports.transport));
            assert!(all_ports.insert(node.ports.psql.unwrap()));
            assert_eq!(node.unicast_hosts.len(), 3);
            assert_eq!(node.cluster_name, DEFAULT_CLUSTER_NAME);
        }
        let node1 = topology.get_node(1).unwrap();
        assert_eq!(node1.working_dir, spec.run_dir().join("node-1"));
        assert!(
            node1
                .unicast_hosts
                .contains(&format!("127.0.0.1:{}", node1.ports.transport))
        );
        assert!(topology.get_node(10).is_none());
    }

    #[test]
    fn test_core_settings_and_overrides() {
        let temp = TempDir::new().unwrap();
        let spec = ClusterSpec::from_version("4.0.0")
            .unwrap()
            .cluster_name("mycluster")
            .setting("stats.enabled", true)
            .setting("http.port", 1)
            .root(temp.path())
            .build()
            .unwrap();
        let ports = [NodePorts {
            http: 4200,
            transport: 4300,
            psql: Some(5432),
        }];
        let node = &ClusterTopology::with_ports(&spec, &ports).nodes[0];
        let surface = node.launch_surface();

        assert_eq!(surface.settings["cluster.name"], "mycluster");
        assert_eq!(surface.settings["psql.port"], "5432");
        assert_eq!(surface.settings["psql.enabled"], "true");
        assert_eq!(surface.settings["stats.enabled"], "true");
        assert_eq!(surface.settings["http.port"], "1");
        assert_eq!(surface.settings["discovery.seed_hosts"], "127.0.0.1:4300");
        assert_eq!(node.http_address(), "127.0.0.1:4200");
    }

    #[test]
    fn test_validate_catches_edited_spec() {
        let spec = spec(1);
        let emptied = ClusterSpec {
            node_count: 0,
            ..spec.clone()
        };
        assert!(matches!(emptied.validate(), Err(Error::Configuration(_))));

        let renamed = ClusterSpec {
            cluster_name: "has space".to_string(),
            ..spec.clone()
        };
        assert!(matches!(renamed.validate(), Err(Error::Configuration(_))));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        assert_eq!(socket_address("::1", 4200), "[::1]:4200");
        assert_eq!(socket_address("127.0.0.1", 4200), "127.0.0.1:4200");
        assert_eq!(socket_address("localhost", 4200), "localhost:4200");

        let spec = ClusterSpec::from_version("4.0.0")
            .unwrap()
            .host("::1")
            .build()
            .unwrap();
        let ports = [NodePorts {
            http: 4200,
            transport: 4300,
            psql: None,
        }];
        let node = &ClusterTopology::with_ports(&spec, &ports).nodes[0];
        assert_eq!(node.http_address(), "[::1]:4200");
        assert_eq!(node.unicast_hosts, vec!["[::1]:4300".to_string()]);
        assert_eq!(node.core_settings()["network.host"], "::1");
    }

    #[test]
    fn test_localhost_resolves() {
        let spec = ClusterSpec::from_version("4.0.0")
            .unwrap()
            .host("localhost")
            .build()
            .unwrap();
        assert!(spec.bind_addr().unwrap().is_loopback());
    }
}
