use std::collections::BTreeMap;

use crate::snapshot::{EntityKind, Epoch};

/// Gauge values computed for one entity in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub kind: EntityKind,
    pub id: String,
    pub values: BTreeMap<String, f64>,
}

impl MetricRecord {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

/// One flattened value as handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample<'a> {
    pub kind: EntityKind,
    pub id: &'a str,
    pub metric: &'a str,
    pub value: f64,
    pub epoch: Epoch,
}

/// All records computed for one cluster at one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBatch {
    pub cluster: String,
    /// Epoch the values describe; older than wall-clock time during replay.
    pub epoch: Epoch,
    pub records: Vec<MetricRecord>,
}

impl MetricBatch {
    pub fn new(cluster: impl Into<String>, epoch: Epoch) -> Self {
        Self {
            cluster: cluster.into(),
            epoch,
            records: Vec::new(),
        }
    }

    /// Finds the record for an entity.
    pub fn record(&self, kind: EntityKind, id: &str) -> Option<&MetricRecord> {
        self.records.iter().find(|r| r.kind == kind && r.id == id)
    }

    /// Iterates every (entity, metric, value) sample stamped with the batch epoch.
    pub fn samples(&self) -> impl Iterator<Item = MetricSample<'_>> {
        let epoch = self.epoch;
        self.records.iter().flat_map(move |r| {
            r.values.iter().map(move |(metric, value)| MetricSample {
                kind: r.kind,
                id: &r.id,
                metric,
                value: *value,
                epoch,
            })
        })
    }

    /// Record counts per entity kind.
    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.records {
            *counts.entry(r.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
