use std::collections::{BTreeMap, BTreeSet};

use super::delta::{counter_delta, safe_ratio, sum_deltas};
use super::record::{MetricBatch, MetricRecord};
use super::rule::{MetricRule, MetricsConfig};
use crate::snapshot::cache::CachedSnapshot;
use crate::snapshot::{EntityKind, Epoch};
use crate::source::Topology;

/// Running state of one rule for one target entity.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accumulator {
    Rate { sum: u64 },
    Ratio { numerator: u64, denominator: u64 },
    Peak { max: u64 },
}

impl Accumulator {
    fn for_rule(rule: &MetricRule) -> Self {
        match rule {
            MetricRule::Rate { .. } => Self::Rate { sum: 0 },
            MetricRule::Ratio { .. } => Self::Ratio {
                numerator: 0,
                denominator: 0,
            },
            MetricRule::Peak { .. } => Self::Peak { max: 0 },
        }
    }

    /// Folds one contributor in. Delta rules ignore contributors without a
    /// valid old snapshot.
    fn add(&mut self, rule: &MetricRule, snapshot: &CachedSnapshot<'_>) {
        match (self, rule) {
            (Self::Peak { max }, MetricRule::Peak { counter, .. }) => {
                if let Some(value) = snapshot.new.get(counter) {
                    *max = (*max).max(value);
                }
            }
            (Self::Rate { sum }, MetricRule::Rate { counter, .. }) => {
                if let Some(old) = snapshot.old {
                    *sum = sum.saturating_add(counter_delta(old, snapshot.new, counter));
                }
            }
            (
                Self::Ratio {
                    numerator,
                    denominator,
                },
                MetricRule::Ratio {
                    numerators,
                    denominator: counter,
                    ..
                },
            ) => {
                if let Some(old) = snapshot.old {
                    *numerator = numerator.saturating_add(sum_deltas(old, snapshot.new, numerators));
                    *denominator =
                        denominator.saturating_add(counter_delta(old, snapshot.new, counter));
                }
            }
            _ => {}
        }
    }

    fn value(&self, rule: &MetricRule, interval: i64) -> f64 {
        match (self, rule) {
            (Self::Rate { sum }, MetricRule::Rate { scale, .. }) => {
                if interval <= 0 {
                    return 0.0;
                }
                (*sum as f64 * scale / interval as f64).trunc()
            }
            (
                Self::Ratio {
                    numerator,
                    denominator,
                },
                MetricRule::Ratio { scale, .. },
            ) => safe_ratio(*numerator as f64 * scale, *denominator as f64),
            (Self::Peak { max }, MetricRule::Peak { .. }) => *max as f64,
            _ => 0.0,
        }
    }
}

/// Where a contributor's counters land for one rule.
#[derive(Debug, Clone, Copy)]
struct RuleRef<'r> {
    level: EntityKind,
    index: usize,
    rule: &'r MetricRule,
}

/// Leaf entity excluded from group aggregation because its parent is unknown.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Unassigned {
    pub kind: EntityKind,
    pub id: String,
}

/// Rolls cached snapshots up into per-entity metric records.
///
/// Accumulation is commutative: contributors may be added in any order.
pub struct Aggregator<'a> {
    rules: &'a MetricsConfig,
    topology: &'a Topology,
    interval: i64,
    by_source: BTreeMap<EntityKind, Vec<RuleRef<'a>>>,
    targets: BTreeMap<(EntityKind, String), Vec<Accumulator>>,
    unassigned: BTreeSet<Unassigned>,
    contributors: usize,
    pairs: usize,
}

impl<'a> Aggregator<'a> {
    pub fn new(rules: &'a MetricsConfig, topology: &'a Topology, interval: i64) -> Self {
        let mut by_source: BTreeMap<EntityKind, Vec<RuleRef<'a>>> = BTreeMap::new();
        for level in EntityKind::all() {
            for (index, rule) in rules.rules(*level).iter().enumerate() {
                by_source.entry(rule.source()).or_default().push(RuleRef {
                    level: *level,
                    index,
                    rule,
                });
            }
        }

        Self {
            rules,
            topology,
            interval,
            by_source,
            targets: BTreeMap::new(),
            unassigned: BTreeSet::new(),
            contributors: 0,
            pairs: 0,
        }
    }

    /// Resolves the entity a contributor reports into at `level`.
    ///
    /// Node-level targets are always the dumping node, whatever id the node's
    /// own entry carries, so a node yields a single record.
    fn target(&self, snapshot: &CachedSnapshot<'_>, level: EntityKind) -> Option<String> {
        let key = snapshot.key;
        match level {
            EntityKind::Node => Some(key.node.clone()),
            _ if level == key.kind => Some(key.id.clone()),
            EntityKind::StorageGroup if key.kind.is_leaf() => self
                .topology
                .parent(key.kind, &key.id)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Adds one cached entity.
    pub fn add(&mut self, snapshot: CachedSnapshot<'_>) {
        let Some(refs) = self.by_source.get(&snapshot.key.kind) else {
            return;
        };
        self.contributors += 1;
        if snapshot.old.is_some() {
            self.pairs += 1;
        }

        for r in refs {
            let Some(target) = self.target(&snapshot, r.level) else {
                self.unassigned.insert(Unassigned {
                    kind: snapshot.key.kind,
                    id: snapshot.key.id.clone(),
                });
                continue;
            };

            let rules = self.rules.rules(r.level);
            let accs = self
                .targets
                .entry((r.level, target))
                .or_insert_with(|| rules.iter().map(Accumulator::for_rule).collect());
            if let Some(acc) = accs.get_mut(r.index) {
                acc.add(r.rule, &snapshot);
            }
        }
    }

    /// Contributors added that had a valid old/new pair.
    pub fn pair_count(&self) -> usize {
        self.pairs
    }

    pub fn contributor_count(&self) -> usize {
        self.contributors
    }

    /// Leaves excluded from storage-group aggregation.
    pub fn unassigned(&self) -> impl Iterator<Item = &Unassigned> {
        self.unassigned.iter()
    }

    /// Produces one record per target entity.
    pub fn finish(self, cluster: &str, epoch: Epoch) -> MetricBatch {
        let mut batch = MetricBatch::new(cluster, epoch);

        for ((level, id), accs) in self.targets {
            let mut record = MetricRecord::new(level, id);
            for (rule, acc) in self.rules.rules(level).iter().zip(accs.iter()) {
                record
                    .values
                    .insert(rule.name().to_string(), acc.value(rule, self.interval));
            }
            batch.records.push(record);
        }

        batch
    }
}
