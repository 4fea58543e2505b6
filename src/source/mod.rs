pub mod spool;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::catalog::DumpId;
use crate::snapshot::{CounterSet, EntityKind};

pub use spool::SpoolSource;

/// Callback type for recording source request metrics.
/// Receives (operation, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Counters for one entity inside a dump.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DumpEntry {
    pub kind: EntityKind,
    pub id: String,
    #[serde(default, deserialize_with = "counter_values")]
    pub counters: BTreeMap<String, u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCounter {
    Integer(u64),
    Decimal(f64),
}

/// Integer counters are taken as-is; fixed-point ones are truncated toward
/// zero. Negative or non-finite values reject the entry.
fn counter_values<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, RawCounter>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, value)| match value {
            RawCounter::Integer(v) => Ok((name, v)),
            RawCounter::Decimal(v) if v.is_finite() && v >= 0.0 => Ok((name, v.trunc() as u64)),
            RawCounter::Decimal(v) => Err(serde::de::Error::custom(format!(
                "counter {name} has invalid value {v}"
            ))),
        })
        .collect()
}

/// Parsed contents of one dump file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dump {
    pub entries: Vec<DumpEntry>,
}

impl Dump {
    /// Iterates entries as (kind, id, counters).
    pub fn counter_sets(&self) -> impl Iterator<Item = (EntityKind, &str, CounterSet)> + '_ {
        self.entries
            .iter()
            .map(|e| (e.kind, e.id.as_str(), CounterSet::new(e.counters.clone())))
    }
}

/// Parent relations of the cluster's entities, refreshed once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Topology {
    /// Participating node ids.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Volume id to storage group.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Extent id to storage group.
    #[serde(default)]
    pub extents: BTreeMap<String, String>,
    /// Port id to node.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

impl Topology {
    /// Entity id to parent id for `kind`, if the kind has a parent.
    pub fn entities(&self, kind: EntityKind) -> Option<&BTreeMap<String, String>> {
        match kind {
            EntityKind::Volume => Some(&self.volumes),
            EntityKind::Extent => Some(&self.extents),
            EntityKind::Port => Some(&self.ports),
            EntityKind::Node | EntityKind::StorageGroup => None,
        }
    }

    pub fn parent(&self, kind: EntityKind, id: &str) -> Option<&str> {
        self.entities(kind)?.get(id).map(String::as_str)
    }
}

/// Supplier of raw counter dumps.
pub trait SnapshotSource: Send + Sync {
    /// Lists the dump identifiers currently available.
    fn list_dumps(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Fetches one dump. `Ok(None)` means the dump is not (or no longer)
    /// available; `Err` means the source itself could not be reached.
    fn fetch_dump(
        &self,
        id: &DumpId,
    ) -> impl std::future::Future<Output = Result<Option<Dump>>> + Send;
}

/// Supplier of the entity parent mapping.
pub trait TopologySource: Send + Sync {
    fn topology(&self) -> impl std::future::Future<Output = Result<Topology>> + Send;
}
