use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDateTime;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::snapshot::{EntityKind, Epoch};

/// Date-time pattern embedded in dump identifiers.
pub const STAMP_FORMAT: &str = "%y%m%d_%H%M%S";

/// Kind of statistics file each node writes per sampling instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpKind {
    /// `Nn`: node CPU and port counters.
    Node,
    /// `Nv`: per-volume counters as seen by the node.
    Volume,
    /// `Nm`: per-extent (mdisk) counters as seen by the node.
    Extent,
    /// `Nd`: per-drive counters.
    Drive,
}

impl DumpKind {
    /// Returns the file-name tag.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Node => "Nn",
            Self::Volume => "Nv",
            Self::Extent => "Nm",
            Self::Drive => "Nd",
        }
    }

    /// Parses a file-name tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Nn" => Some(Self::Node),
            "Nv" => Some(Self::Volume),
            "Nm" => Some(Self::Extent),
            "Nd" => Some(Self::Drive),
            _ => None,
        }
    }

    /// Entity kinds whose counters this dump carries.
    pub const fn entity_kinds(self) -> &'static [EntityKind] {
        match self {
            Self::Node => &[EntityKind::Node, EntityKind::Port],
            Self::Volume => &[EntityKind::Volume],
            Self::Extent => &[EntityKind::Extent],
            Self::Drive => &[],
        }
    }

    pub const fn all() -> &'static [DumpKind] {
        &[Self::Node, Self::Volume, Self::Extent, Self::Drive]
    }
}

/// Why an identifier was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("expected <tag>_stats_<node>_<yymmdd>_<HHMMSS>, got {0:?}")]
    Grammar(String),
    #[error("unknown dump tag {tag:?} in {name:?}")]
    UnknownTag { tag: String, name: String },
    #[error("invalid timestamp {stamp:?} in {name:?}")]
    Timestamp { stamp: String, name: String },
}

/// A parsed dump identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DumpId {
    pub epoch: Epoch,
    pub kind: DumpKind,
    pub node: String,
    /// Date-time portion exactly as it appears in the name.
    pub stamp: String,
}

impl DumpId {
    /// Parses an identifier, ignoring any leading directory.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let name = raw.trim();
        let name = name.rsplit('/').next().unwrap_or(name);

        let parts: Vec<&str> = name.split('_').collect();
        if parts.len() < 5 || parts[1] != "stats" {
            return Err(IdentifierError::Grammar(name.to_string()));
        }

        let tag = parts[0];
        let kind = DumpKind::from_tag(tag).ok_or_else(|| IdentifierError::UnknownTag {
            tag: tag.to_string(),
            name: name.to_string(),
        })?;

        let day = parts[parts.len() - 2];
        let time = parts[parts.len() - 1];
        let node = parts[2..parts.len() - 2].join("_");
        if node.is_empty() {
            return Err(IdentifierError::Grammar(name.to_string()));
        }

        let stamp = format!("{day}_{time}");
        let epoch = parse_stamp(&stamp).ok_or_else(|| IdentifierError::Timestamp {
            stamp: stamp.clone(),
            name: name.to_string(),
        })?;

        Ok(Self {
            epoch,
            kind,
            node,
            stamp,
        })
    }

    /// Builds the canonical identifier for a node, kind and epoch.
    pub fn for_epoch(kind: DumpKind, node: impl Into<String>, epoch: Epoch) -> Option<Self> {
        Some(Self {
            epoch,
            kind,
            node: node.into(),
            stamp: format_stamp(epoch)?,
        })
    }

    /// The (node, kind) slot this dump fills.
    pub fn slot(&self) -> DumpSlot {
        DumpSlot {
            node: self.node.clone(),
            kind: self.kind,
        }
    }

    /// File name in the canonical grammar.
    pub fn file_name(&self) -> String {
        format!("{}_stats_{}_{}", self.kind.tag(), self.node, self.stamp)
    }
}

impl fmt::Display for DumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// One node's dump stream of a single kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DumpSlot {
    pub node: String,
    pub kind: DumpKind,
}

/// Parses `yymmdd_HHMMSS` as UTC seconds.
pub fn parse_stamp(stamp: &str) -> Option<Epoch> {
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Formats UTC seconds as `yymmdd_HHMMSS`.
pub fn format_stamp(epoch: Epoch) -> Option<String> {
    chrono::DateTime::from_timestamp(epoch, 0).map(|dt| dt.format(STAMP_FORMAT).to_string())
}

/// Dumps observed for one sampling instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRecord {
    pub epoch: Epoch,
    /// Date-time string of the first identifier seen for this epoch.
    pub display: String,
    /// Distinct identifiers seen for this epoch.
    pub observed_count: u32,
}

/// Result of classifying one dump listing.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: BTreeMap<Epoch, TimestampRecord>,
    dumps: BTreeMap<Epoch, BTreeSet<DumpId>>,
    rejected: usize,
}

impl Catalog {
    /// Groups identifiers by the epoch they encode.
    ///
    /// Malformed identifiers and dump kinds outside `kinds` are skipped; the
    /// former are logged and counted in [`Catalog::rejected`].
    pub fn classify<'a, I>(identifiers: I, kinds: &[DumpKind]) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut catalog = Self::default();

        for raw in identifiers {
            if raw.trim().is_empty() {
                continue;
            }
            let id = match DumpId::parse(raw) {
                Ok(id) => id,
                Err(e) => {
                    warn!(identifier = raw, error = %e, "skipping malformed dump identifier");
                    catalog.rejected += 1;
                    continue;
                }
            };
            if !kinds.contains(&id.kind) {
                debug!(identifier = raw, "ignoring untracked dump kind");
                continue;
            }

            let epoch = id.epoch;
            let display = id.stamp.clone();
            if !catalog.dumps.entry(epoch).or_default().insert(id) {
                continue;
            }

            let record = catalog
                .records
                .entry(epoch)
                .or_insert_with(|| TimestampRecord {
                    epoch,
                    display,
                    observed_count: 0,
                });
            record.observed_count = record.observed_count.saturating_add(1);
        }

        catalog
    }

    pub fn record(&self, epoch: Epoch) -> Option<&TimestampRecord> {
        self.records.get(&epoch)
    }

    /// Dumps seen for `epoch`.
    pub fn dumps(&self, epoch: Epoch) -> impl Iterator<Item = &DumpId> {
        self.dumps.get(&epoch).into_iter().flatten()
    }

    /// Whether every expected dump for `epoch` has been observed.
    pub fn is_complete(&self, epoch: Epoch, expected: u32) -> bool {
        expected > 0
            && self
                .records
                .get(&epoch)
                .is_some_and(|r| r.observed_count == expected)
    }

    /// Most recent complete epoch.
    pub fn latest_complete(&self, expected: u32) -> Option<Epoch> {
        self.records
            .values()
            .rev()
            .find(|r| expected > 0 && r.observed_count == expected)
            .map(|r| r.epoch)
    }

    /// Number of complete epochs strictly later than `epoch`.
    pub fn complete_after(&self, epoch: Epoch, expected: u32) -> usize {
        self.records
            .range(epoch + 1..)
            .filter(|(_, r)| expected > 0 && r.observed_count == expected)
            .count()
    }

    /// Number of identifiers rejected as malformed.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}
