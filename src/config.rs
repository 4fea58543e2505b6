use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::catalog::DumpKind;
use crate::metrics::rule::MetricsConfig;

/// Top-level configuration for the statsync agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Metric dispatch configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Monitored storage clusters. Each gets an independent poll driver.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// One monitored storage cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name used in logs, metrics and exported batches.
    #[serde(default)]
    pub name: String,

    /// Sampling interval the cluster dumps statistics at. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How often to poll. Defaults to the sampling interval.
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    /// A poll running longer than this is abandoned. Default: 45s.
    #[serde(default = "default_cycle_timeout", with = "humantime_serde")]
    pub cycle_timeout: Duration,

    /// Number of dumping nodes. Defaults to the node count of the topology.
    #[serde(default)]
    pub expected_nodes: Option<u32>,

    /// Dump kinds every node writes per sampling instant.
    #[serde(default = "default_dump_kinds")]
    pub dump_kinds: Vec<DumpKind>,

    /// Catch-up backlog bounds.
    #[serde(default)]
    pub backlog: BacklogConfig,

    /// Where dumps and topology are read from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Tracked-counter rules per output level.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Catch-up backlog bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct BacklogConfig {
    /// Complete later epochs after which a pending epoch is dropped. Default: 15.
    #[serde(default = "default_eviction_bound")]
    pub eviction_bound: u32,

    /// Maximum pending epochs; the oldest is dropped beyond this. Default: 64.
    #[serde(default = "default_backlog_max_entries")]
    pub max_entries: usize,
}

/// Local dump spool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Directory the cluster's dump files are mirrored into.
    #[serde(default)]
    pub spool_dir: PathBuf,

    /// YAML file mapping volumes/extents to storage groups and ports to nodes.
    #[serde(default)]
    pub topology_file: Option<PathBuf>,
}

/// Metric dispatch configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksConfig {
    /// Log every record through tracing.
    #[serde(default)]
    pub log: LogSinkConfig,

    /// NDJSON over HTTP.
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// Log sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSinkConfig {
    /// Enable the log sink. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// HTTP export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum duration for an export request. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cycle_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_dump_kinds() -> Vec<DumpKind> {
    DumpKind::all().to_vec()
}

fn default_eviction_bound() -> u32 {
    15
}

fn default_backlog_max_entries() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            sinks: SinksConfig::default(),
            clusters: Vec::new(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            interval: default_interval(),
            poll_interval: None,
            cycle_timeout: default_cycle_timeout(),
            expected_nodes: None,
            dump_kinds: default_dump_kinds(),
            backlog: BacklogConfig::default(),
            source: SourceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            eviction_bound: default_eviction_bound(),
            max_entries: default_backlog_max_entries(),
        }
    }
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Looks up a cluster by name.
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("at least one cluster is required");
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            cluster.validate()?;
            if !names.insert(cluster.name.as_str()) {
                bail!("duplicate cluster name: {}", cluster.name);
            }
        }

        // Validate HTTP export config if enabled.
        if self.sinks.http.enabled {
            if self.sinks.http.address.is_empty() {
                bail!("http address is required when enabled");
            }
            if self.sinks.http.timeout.is_zero() {
                bail!("http timeout must be positive when enabled");
            }

            let compression = &self.sinks.http.compression;
            match compression.as_str() {
                "none" | "gzip" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }
}

impl ClusterConfig {
    /// Sampling interval in whole seconds.
    pub fn interval_secs(&self) -> i64 {
        i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX)
    }

    /// Effective poll period.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(self.interval)
    }

    /// Dumps expected per complete epoch, given the topology's node count.
    pub fn expected_dumps(&self, topology_nodes: usize) -> u32 {
        let nodes = self
            .expected_nodes
            .unwrap_or_else(|| u32::try_from(topology_nodes).unwrap_or(u32::MAX));
        let kinds = u32::try_from(self.dump_kinds.len()).unwrap_or(u32::MAX);
        nodes.saturating_mul(kinds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("cluster name is required");
        }
        let name = &self.name;

        if self.interval.is_zero() {
            bail!("cluster {name}: interval must be positive");
        }
        if self.interval.subsec_nanos() != 0 {
            bail!("cluster {name}: interval must be a whole number of seconds");
        }
        if self.poll_interval.is_some_and(|d| d.is_zero()) {
            bail!("cluster {name}: poll_interval must be positive");
        }
        if self.cycle_timeout.is_zero() {
            bail!("cluster {name}: cycle_timeout must be positive");
        }

        if self.expected_nodes == Some(0) {
            bail!("cluster {name}: expected_nodes must be positive");
        }
        if self.expected_nodes.is_none() && self.source.topology_file.is_none() {
            bail!("cluster {name}: expected_nodes or source.topology_file is required");
        }

        if self.dump_kinds.is_empty() {
            bail!("cluster {name}: dump_kinds must not be empty");
        }
        let mut kinds = HashSet::new();
        for kind in &self.dump_kinds {
            if !kinds.insert(kind) {
                bail!("cluster {name}: duplicate dump kind {}", kind.tag());
            }
        }

        if self.backlog.eviction_bound == 0 {
            bail!("cluster {name}: backlog.eviction_bound must be positive");
        }
        if self.backlog.max_entries == 0 {
            bail!("cluster {name}: backlog.max_entries must be positive");
        }

        if self.source.spool_dir.as_os_str().is_empty() {
            bail!("cluster {name}: source.spool_dir is required");
        }

        self.metrics
            .validate()
            .with_context(|| format!("cluster {name}: invalid metrics"))?;

        for (level, rule) in self.metrics.iter() {
            let source = rule.source();
            let fetched = self
                .dump_kinds
                .iter()
                .any(|k| k.entity_kinds().contains(&source));
            if !fetched {
                bail!(
                    "cluster {name}: {level} metric {:?} reads {source} counters but no configured dump kind carries them",
                    rule.name()
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::rule::MetricRule;
    use crate::snapshot::EntityKind;

    fn valid_cluster() -> ClusterConfig {
        ClusterConfig {
            name: "svc01".to_string(),
            expected_nodes: Some(2),
            source: SourceConfig {
                spool_dir: PathBuf::from("/var/spool/statsync/svc01"),
                topology_file: None,
            },
            ..Default::default()
        }
    }

    fn valid_config() -> Config {
        Config {
            clusters: vec![valid_cluster()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.sinks.log.enabled);
        assert!(!cfg.sinks.http.enabled);
        assert_eq!(cfg.sinks.http.compression, "gzip");

        let cluster = ClusterConfig::default();
        assert_eq!(cluster.interval, Duration::from_secs(60));
        assert_eq!(cluster.poll_interval(), Duration::from_secs(60));
        assert_eq!(cluster.backlog.eviction_bound, 15);
        assert_eq!(cluster.backlog.max_entries, 64);
        assert_eq!(cluster.dump_kinds.len(), 4);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
health:
  addr: "127.0.0.1:9191"
sinks:
  http:
    enabled: true
    address: http://collector:8080/ingest
    compression: none
    timeout: 5s
clusters:
  - name: svc01
    interval: 30s
    poll_interval: 10s
    expected_nodes: 2
    dump_kinds: [node, volume, extent]
    backlog:
      eviction_bound: 5
    source:
      spool_dir: /tmp/spool
      topology_file: /tmp/topology.yaml
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.sinks.http.timeout, Duration::from_secs(5));
        let cluster = cfg.cluster("svc01").expect("cluster present");
        assert_eq!(cluster.interval_secs(), 30);
        assert_eq!(cluster.poll_interval(), Duration::from_secs(10));
        assert_eq!(cluster.backlog.eviction_bound, 5);
        assert_eq!(cluster.backlog.max_entries, 64);
        assert_eq!(cluster.expected_dumps(7), 6);
        assert!(cfg.cluster("other").is_none());
    }

    #[test]
    fn test_expected_dumps_from_topology() {
        let cluster = ClusterConfig {
            expected_nodes: None,
            ..valid_cluster()
        };
        assert_eq!(cluster.expected_dumps(2), 8);
        assert_eq!(cluster.expected_dumps(0), 0);
    }

    #[test]
    fn test_validation_requires_cluster() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("at least one cluster"));
    }

    #[test]
    fn test_validation_duplicate_cluster_name() {
        let cfg = Config {
            clusters: vec![valid_cluster(), valid_cluster()],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate cluster name"));
    }

    #[test]
    fn test_validation_interval_whole_seconds() {
        let mut cfg = valid_config();
        cfg.clusters[0].interval = Duration::from_millis(1500);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"));

        cfg.clusters[0].interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval must be positive"));
    }

    #[test]
    fn test_validation_backlog_bounds() {
        let mut cfg = valid_config();
        cfg.clusters[0].backlog.eviction_bound = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("eviction_bound"));

        cfg.clusters[0].backlog.eviction_bound = 1;
        cfg.clusters[0].backlog.max_entries = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_entries"));
    }

    #[test]
    fn test_validation_node_count_source() {
        let mut cfg = valid_config();
        cfg.clusters[0].expected_nodes = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("topology_file"));

        cfg.clusters[0].source.topology_file = Some(PathBuf::from("/tmp/topo.yaml"));
        cfg.validate().expect("topology supplies node count");

        cfg.clusters[0].expected_nodes = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_dump_kinds() {
        let mut cfg = valid_config();
        cfg.clusters[0].dump_kinds = vec![DumpKind::Node, DumpKind::Node];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate dump kind Nn"));

        cfg.clusters[0].dump_kinds.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rule_needs_fetched_kind() {
        let mut cfg = valid_config();
        cfg.clusters[0].dump_kinds = vec![DumpKind::Volume];
        cfg.clusters[0].metrics = MetricsConfig {
            node: vec![],
            storage_group: vec![],
            volume: vec![MetricRule::rate("read_io_rate", EntityKind::Volume, "ro", 1.0)],
            extent: vec![MetricRule::rate("read_io_rate", EntityKind::Extent, "ro", 1.0)],
            port: vec![],
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reads extent counters"));
    }

    #[test]
    fn test_validation_invalid_metrics_context() {
        let mut cfg = valid_config();
        cfg.clusters[0].metrics.port = vec![MetricRule::rate("", EntityKind::Port, "hbt", 1.0)];
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("cluster svc01: invalid metrics"));
    }

    #[test]
    fn test_validation_http() {
        let mut cfg = valid_config();
        cfg.sinks.http.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("http address"));

        cfg.sinks.http.address = "http://localhost:8686".to_string();
        cfg.sinks.http.compression = "zstd".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid compression type"));

        cfg.sinks.http.compression = "none".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("statsync.yaml");
        std::fs::write(
            &path,
            "clusters:\n  - name: a\n    expected_nodes: 1\n    source:\n      spool_dir: /tmp/a\n",
        )
        .expect("write config");

        let cfg = Config::load(&path).expect("loads");
        assert_eq!(cfg.clusters.len(), 1);

        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
