//! Version-aware translation of node settings into command-line flags.
//!
//! CrateDB changed its configuration surface several times. Instead of
//! branching on versions wherever settings are built, every change is a
//! [`Regime`]: a version threshold paired with a transformation. Regimes are
//! applied in table order, so supporting a new release means appending a row.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Ordered settings map rendered into `<prefix><key>=<value>` flags.
pub type Settings = BTreeMap<String, String>;

/// A dotted, numeric version such as `4.0.12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrateVersion {
    components: Vec<u64>,
}

impl CrateVersion {
    /// Parses a version string. Every `.`-separated component must be a
    /// non-negative integer.
    pub fn parse(version: &str) -> Option<Self> {
        let components = version
            .trim()
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if components.is_empty() {
            return None;
        }
        Some(Self { components })
    }

    /// Version used when nothing better is known: the newest regime applies.
    pub fn latest() -> Self {
        Self {
            components: vec![u64::MAX],
        }
    }

    pub(crate) fn from_static(components: &[u64]) -> Self {
        Self {
            components: components.to_vec(),
        }
    }
}

impl Ord for CrateVersion {
    /// Numeric, component by component. When the shared prefix is equal the
    /// version with fewer components is lower, so `1.0 < 1.0.0`.
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.components.iter().zip(&other.components) {
            match a.cmp(b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for CrateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CrateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Which side of the threshold a regime applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Applies to versions strictly below the threshold.
    Below,
    /// Applies to versions at or above the threshold.
    AtLeast,
}

/// Everything a regime may read or rewrite.
#[derive(Debug, Clone, Default)]
pub struct LaunchSurface {
    /// Settings passed as flags.
    pub settings: Settings,
    /// Prefix placed in front of every settings flag.
    pub flag_prefix: String,
    /// Extra environment variables for the server process.
    pub env: BTreeMap<String, String>,
}

/// Inputs available to regimes besides the settings under construction.
#[derive(Debug, Clone, Default)]
pub struct RegimeContext {
    /// `host:transport_port` of every cluster member.
    pub unicast_hosts: Vec<String>,
    /// Java 8 installation used for releases that cannot run on newer JVMs.
    pub java8_home: Option<PathBuf>,
}

/// One step in the configuration-surface history.
pub struct Regime {
    pub name: &'static str,
    pub threshold: &'static [u64],
    pub bound: Bound,
    pub apply: fn(&mut LaunchSurface, &RegimeContext),
}

impl Regime {
    fn applies_to(&self, version: &CrateVersion) -> bool {
        let threshold = CrateVersion::from_static(self.threshold);
        match self.bound {
            Bound::Below => version < &threshold,
            Bound::AtLeast => version >= &threshold,
        }
    }
}

impl fmt::Debug for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regime")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

fn legacy_es_flags(surface: &mut LaunchSurface, _: &RegimeContext) {
    surface.flag_prefix = "-Des.".to_string();
}

fn legacy_discovery_and_storage(surface: &mut LaunchSurface, _: &RegimeContext) {
    surface.settings.insert(
        "discovery.zen.ping.multicast.enabled".to_string(),
        "false".to_string(),
    );
    surface
        .settings
        .insert("index.storage.type".to_string(), "memory".to_string());
}

fn crate_flags(surface: &mut LaunchSurface, _: &RegimeContext) {
    surface.flag_prefix = "-C".to_string();
}

fn java8_runtime(surface: &mut LaunchSurface, ctx: &RegimeContext) {
    if let Some(home) = &ctx.java8_home {
        surface
            .env
            .insert("JAVA_HOME".to_string(), home.display().to_string());
    }
}

fn zen_unicast(surface: &mut LaunchSurface, ctx: &RegimeContext) {
    surface.settings.insert(
        "discovery.zen.ping.unicast.hosts".to_string(),
        ctx.unicast_hosts.join(","),
    );
}

fn seed_hosts(surface: &mut LaunchSurface, ctx: &RegimeContext) {
    let hosts = ctx.unicast_hosts.join(",");
    surface
        .settings
        .insert("discovery.seed_hosts".to_string(), hosts.clone());
    surface
        .settings
        .insert("cluster.initial_master_nodes".to_string(), hosts);
}

/// The configuration-surface history, oldest change first.
pub const REGIMES: &[Regime] = &[
    Regime {
        name: "es-system-properties",
        threshold: &[1, 0, 0],
        bound: Bound::Below,
        apply: legacy_es_flags,
    },
    Regime {
        name: "multicast-and-memory-storage",
        threshold: &[2, 0, 0],
        bound: Bound::Below,
        apply: legacy_discovery_and_storage,
    },
    Regime {
        name: "crate-flags",
        threshold: &[1, 0, 0],
        bound: Bound::AtLeast,
        apply: crate_flags,
    },
    Regime {
        name: "java8-runtime",
        threshold: &[3, 2, 0],
        bound: Bound::Below,
        apply: java8_runtime,
    },
    Regime {
        name: "zen-unicast-discovery",
        threshold: &[4, 0, 0],
        bound: Bound::Below,
        apply: zen_unicast,
    },
    Regime {
        name: "seed-hosts-discovery",
        threshold: &[4, 0, 0],
        bound: Bound::AtLeast,
        apply: seed_hosts,
    },
];

/// Builds the full launch surface for `version`.
///
/// `base` holds the core settings (host, cluster name, ports), `overrides`
/// the caller-supplied settings which are applied after every regime.
pub fn launch_surface(
    version: &CrateVersion,
    base: Settings,
    overrides: &Settings,
    ctx: &RegimeContext,
) -> LaunchSurface {
    let mut surface = LaunchSurface {
        settings: base,
        flag_prefix: "-C".to_string(),
        env: BTreeMap::new(),
    };
    for regime in REGIMES.iter().filter(|r| r.applies_to(version)) {
        (regime.apply)(&mut surface, ctx);
    }
    for (key, value) in overrides {
        surface.settings.insert(key.clone(), value.clone());
    }
    surface
}

/// Settings for `version` with the peer list wired in.
pub fn settings_for(
    version: &CrateVersion,
    base: Settings,
    overrides: &Settings,
    unicast_hosts: &[String],
) -> Settings {
    let ctx = RegimeContext {
        unicast_hosts: unicast_hosts.to_vec(),
        java8_home: None,
    };
    launch_surface(version, base, overrides, &ctx).settings
}

/// Flag prefix used by `version` (`-Des.` or `-C`).
pub fn flag_prefix(version: &CrateVersion) -> String {
    launch_surface(version, Settings::new(), &Settings::new(), &RegimeContext::default())
        .flag_prefix
}

/// Renders settings into `<prefix><key>=<value>` arguments, ordered by key.
pub fn render_flags(surface: &LaunchSurface) -> Vec<String> {
    surface
        .settings
        .iter()
        .map(|(key, value)| format!("{}{key}={value}", surface.flag_prefix))
        .collect()
}
