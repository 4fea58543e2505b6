pub mod cache;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// Seconds since the Unix epoch identifying one sampling instant.
pub type Epoch = i64;

/// Kind of monitored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    StorageGroup,
    Volume,
    Port,
    /// Backend storage extent (mdisk).
    Extent,
}

impl EntityKind {
    /// Returns the canonical string representation for logs and export.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::StorageGroup => "storage_group",
            Self::Volume => "volume",
            Self::Port => "port",
            Self::Extent => "extent",
        }
    }

    /// Leaf kinds report directly from raw counters.
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Volume | Self::Extent)
    }

    /// All kinds, in reporting order.
    pub const fn all() -> &'static [EntityKind] {
        &[
            Self::Node,
            Self::StorageGroup,
            Self::Volume,
            Self::Extent,
            Self::Port,
        ]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable set of named counters captured for one entity at one instant.
///
/// Cloning is cheap; the underlying map is shared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSet(Arc<BTreeMap<String, u64>>);

impl CounterSet {
    pub fn new(counters: BTreeMap<String, u64>) -> Self {
        Self(Arc::new(counters))
    }

    /// Returns the value of `name`, if the counter was reported.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for CounterSet {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Identity of a raw counter stream: the node that dumped it plus the entity.
///
/// Leaf entities are seen by every node that serves I/O for them, so the same
/// volume appears once per origin node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey {
    pub node: String,
    pub kind: EntityKind,
    pub id: String,
}

impl SnapshotKey {
    pub fn new(node: impl Into<String>, kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind, self.id)
    }
}

/// Old/new counter sets for one entity, captured exactly one interval apart.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPair {
    pub old: CounterSet,
    pub new: CounterSet,
    pub old_epoch: Epoch,
    pub new_epoch: Epoch,
}
