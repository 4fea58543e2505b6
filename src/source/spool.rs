use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Dump, DumpEntry, MetricsCallback, SnapshotSource, Topology, TopologySource};
use crate::catalog::DumpId;
use crate::config::SourceConfig;

/// Reads dumps from a local directory that a transfer job keeps in sync with
/// the cluster's dump directory.
///
/// Each dump is a JSON document `{"entries": [{"kind", "id", "counters"}]}`
/// stored under its identifier as the file name. The topology is a YAML file.
pub struct SpoolSource {
    dir: PathBuf,
    topology_file: Option<PathBuf>,
    metrics: Option<MetricsCallback>,
}

#[derive(Deserialize)]
struct RawDump {
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

impl SpoolSource {
    pub fn new(cfg: &SourceConfig) -> Self {
        Self {
            dir: cfg.spool_dir.clone(),
            topology_file: cfg.topology_file.clone(),
            metrics: None,
        }
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_request(&self, operation: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }

    async fn read_dir_names(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("opening spool directory {}", self.dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("listing spool directory {}", self.dir.display()))?
        {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!(name = ?raw, "skipping non UTF-8 spool entry"),
            }
        }
        Ok(names)
    }

    async fn read_dump(&self, id: &DumpId) -> Result<Option<Dump>> {
        let path = self.dir.join(id.file_name());
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading dump {}", path.display()));
            }
        };

        Ok(Some(parse_dump(&body, id)?))
    }

    async fn read_topology(&self) -> Result<Topology> {
        let Some(path) = &self.topology_file else {
            return Ok(Topology::default());
        };
        let body = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading topology file {}", path.display()))?;
        serde_yaml::from_str(&body)
            .with_context(|| format!("parsing topology file {}", path.display()))
    }
}

/// Parses a dump body. Entries that do not decode are skipped individually.
pub fn parse_dump(body: &[u8], id: &DumpId) -> Result<Dump> {
    let raw: RawDump =
        serde_json::from_slice(body).with_context(|| format!("parsing dump {id}"))?;

    let mut entries = Vec::with_capacity(raw.entries.len());
    for (idx, value) in raw.entries.into_iter().enumerate() {
        match serde_json::from_value::<DumpEntry>(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(dump = %id, index = idx, error = %e, "skipping unparseable dump entry");
            }
        }
    }

    Ok(Dump { entries })
}

impl SnapshotSource for SpoolSource {
    async fn list_dumps(&self) -> Result<Vec<String>> {
        let start = Instant::now();
        let result = self.read_dir_names().await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request("list", status, start.elapsed());
        result
    }

    async fn fetch_dump(&self, id: &DumpId) -> Result<Option<Dump>> {
        let start = Instant::now();
        let result = self.read_dump(id).await;
        let status = match &result {
            Ok(Some(_)) => "success",
            Ok(None) => "missing",
            Err(_) => "error",
        };
        self.record_request("fetch", status, start.elapsed());
        if let Ok(Some(dump)) = &result {
            debug!(dump = %id, entries = dump.entries.len(), "fetched dump");
        }
        result
    }
}

impl TopologySource for SpoolSource {
    async fn topology(&self) -> Result<Topology> {
        let start = Instant::now();
        let result = self.read_topology().await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request("topology", status, start.elapsed());
        result
    }
}
