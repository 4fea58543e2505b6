use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::future::{join, join_all};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, DumpId, DumpKind, DumpSlot};
use crate::config::ClusterConfig;
use crate::metrics::aggregate::{Aggregator, Unassigned};
use crate::metrics::record::MetricBatch;
use crate::metrics::rule::MetricsConfig;
use crate::reconcile::{Backlog, Phase, Reconciler};
use crate::snapshot::cache::SnapshotCache;
use crate::snapshot::{Epoch, SnapshotKey};
use crate::source::{Dump, SnapshotSource, Topology, TopologySource};

/// Everything one cluster's poll driver carries from cycle to cycle.
#[derive(Debug, Clone)]
pub struct CollectionState {
    reconciler: Reconciler,
    cache: SnapshotCache,
    /// Epoch of the last dump committed per (node, dump kind).
    slot_epochs: HashMap<DumpSlot, Epoch>,
}

impl CollectionState {
    pub fn new(cfg: &ClusterConfig) -> Self {
        let interval = cfg.interval_secs();
        Self {
            reconciler: Reconciler::new(
                interval,
                cfg.backlog.eviction_bound,
                cfg.backlog.max_entries,
            ),
            cache: SnapshotCache::new(interval),
            slot_epochs: HashMap::new(),
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.reconciler.current_epoch()
    }

    pub fn last_consumed_epoch(&self) -> Epoch {
        self.reconciler.last_consumed_epoch()
    }

    pub fn phase(&self) -> Phase {
        self.reconciler.phase()
    }

    pub fn backlog(&self) -> &Backlog {
        self.reconciler.backlog()
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Records that a poll was abandoned before it could commit, e.g. on a
    /// cycle timeout. Progress and cached snapshots are kept.
    pub fn mark_stalled(&mut self) {
        self.reconciler.stall();
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new to process.
    Idle,
    /// A forward step or backlog replay completed.
    Processed,
    /// The poll could not make progress; state is unchanged.
    Stalled { reason: String },
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processed => "processed",
            Self::Stalled { .. } => "stalled",
        }
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled { reason } => write!(f, "stalled: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Batches to dispatch, replayed epochs included. Oldest first.
    pub batches: Vec<MetricBatch>,
    pub enqueued: Vec<Epoch>,
    pub evicted: Vec<Epoch>,
    pub recovered: Option<Epoch>,
    /// Skipped epochs dropped without being queued, after a long outage.
    pub overflowed: u64,
    /// Identifiers that did not match the dump naming grammar.
    pub malformed: usize,
    /// Leaves excluded from storage-group aggregation.
    pub unassigned: usize,
    pub elapsed: Duration,
}

impl PollReport {
    fn new(outcome: PollOutcome) -> Self {
        Self {
            outcome,
            batches: Vec::new(),
            enqueued: Vec::new(),
            evicted: Vec::new(),
            recovered: None,
            overflowed: 0,
            malformed: 0,
            unassigned: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Dumps fetched for one epoch and the epoch one interval before it.
struct Fetched {
    epoch: Epoch,
    current: Vec<(DumpId, Dump)>,
    previous: Vec<(DumpId, Dump)>,
}

/// Per-cluster collection engine.
///
/// [`Engine::poll`] performs all source I/O before touching the
/// [`CollectionState`], so dropping the future mid-poll leaves the state as
/// the last completed poll left it.
pub struct Engine<S> {
    cluster: String,
    interval: i64,
    dump_kinds: Vec<DumpKind>,
    /// Dump kinds whose entities some rule reads.
    fetch_kinds: Vec<DumpKind>,
    expected_nodes: Option<u32>,
    rules: MetricsConfig,
    source: S,
}

impl<S> Engine<S>
where
    S: SnapshotSource + TopologySource,
{
    pub fn new(cfg: &ClusterConfig, source: S) -> Self {
        let sources = cfg.metrics.source_kinds();
        let fetch_kinds = cfg
            .dump_kinds
            .iter()
            .copied()
            .filter(|k| k.entity_kinds().iter().any(|e| sources.contains(e)))
            .collect();

        Self {
            cluster: cfg.name.clone(),
            interval: cfg.interval_secs(),
            dump_kinds: cfg.dump_kinds.clone(),
            fetch_kinds,
            expected_nodes: cfg.expected_nodes,
            rules: cfg.metrics.clone(),
            source,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn expected_dumps(&self, topology: &Topology) -> u32 {
        let nodes = self
            .expected_nodes
            .unwrap_or_else(|| u32::try_from(topology.nodes.len()).unwrap_or(u32::MAX));
        nodes.saturating_mul(u32::try_from(self.dump_kinds.len()).unwrap_or(u32::MAX))
    }

    /// Runs one poll cycle against `state`.
    pub async fn poll(&self, state: &mut CollectionState) -> PollReport {
        let start = Instant::now();
        let mut report = self.poll_inner(state).await;
        report.elapsed = start.elapsed();

        match &report.outcome {
            PollOutcome::Stalled { reason } => {
                state.reconciler.stall();
                warn!(
                    cluster = %self.cluster,
                    current_epoch = state.current_epoch(),
                    reason = %reason,
                    "poll stalled, will retry",
                );
            }
            PollOutcome::Idle => {
                debug!(cluster = %self.cluster, "no new complete epoch");
            }
            PollOutcome::Processed => {
                for batch in &report.batches {
                    info!(
                        cluster = %self.cluster,
                        epoch = batch.epoch,
                        records = batch.records.len(),
                        counts = ?batch.counts(),
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "collected metrics",
                    );
                }
            }
        }

        report
    }

    async fn poll_inner(&self, state: &mut CollectionState) -> PollReport {
        let (listing, topology) = match join(self.source.list_dumps(), self.source.topology()).await
        {
            (Ok(listing), Ok(topology)) => (listing, topology),
            (Err(e), _) => return stalled(format!("listing dumps: {e:#}")),
            (_, Err(e)) => return stalled(format!("loading topology: {e:#}")),
        };

        let expected = self.expected_dumps(&topology);
        if expected == 0 {
            return stalled("no participating nodes known".to_string());
        }

        let catalog = Catalog::classify(listing.iter().map(String::as_str), &self.dump_kinds);
        if state.current_epoch() == 0 && catalog.latest_complete(expected).is_none() {
            let mut report = stalled("no complete epoch observed yet".to_string());
            report.malformed = catalog.rejected();
            return report;
        }

        let plan = state.reconciler.plan(&catalog, expected);

        let forward = match plan.forward {
            Some(epoch) => {
                let rotated: HashSet<DumpSlot> = state
                    .slot_epochs
                    .iter()
                    .filter(|(_, e)| **e + self.interval == epoch)
                    .map(|(slot, _)| slot.clone())
                    .collect();
                match self.fetch(&catalog, epoch, &rotated).await {
                    Ok(fetched) => Some(fetched),
                    Err(e) => {
                        let mut report = stalled(format!("fetching epoch {epoch}: {e:#}"));
                        report.malformed = catalog.rejected();
                        return report;
                    }
                }
            }
            None => None,
        };

        let replay = match plan.replay {
            Some(epoch) => match self.fetch(&catalog, epoch, &HashSet::new()).await {
                Ok(fetched) => Some(fetched),
                Err(e) => {
                    warn!(
                        cluster = %self.cluster,
                        epoch,
                        error = %e,
                        "backlog replay failed, keeping epoch queued",
                    );
                    None
                }
            },
            None => None,
        };

        // All I/O is done; everything below is a synchronous commit.
        let outcome = if forward.is_some() || replay.is_some() {
            PollOutcome::Processed
        } else {
            PollOutcome::Idle
        };
        let mut report = PollReport::new(outcome);
        report.malformed = catalog.rejected();

        let mut unassigned = BTreeSet::new();

        if let Some(fetched) = &replay {
            let mut scratch = SnapshotCache::new(self.interval);
            load(&mut scratch, fetched);
            if let Some(batch) = self.aggregate(&scratch, &topology, fetched.epoch, &mut unassigned) {
                report.batches.push(batch);
            }
        }

        if let Some(fetched) = &forward {
            load(&mut state.cache, fetched);
            let dropped = state.cache.retain_epoch(fetched.epoch);
            if !dropped.is_empty() {
                debug!(cluster = %self.cluster, count = dropped.len(), "dropped entities absent from latest dumps");
            }
            state.slot_epochs = fetched
                .current
                .iter()
                .map(|(id, _)| (id.slot(), fetched.epoch))
                .collect();

            if let Some(batch) =
                self.aggregate(&state.cache, &topology, fetched.epoch, &mut unassigned)
            {
                report.batches.push(batch);
            }
        }

        let applied = state.reconciler.commit(&plan, replay.is_some());
        if let Some(overflow) = &applied.overflow {
            warn!(
                cluster = %self.cluster,
                first = overflow.first,
                last = overflow.last,
                count = overflow.count,
                "skipped epochs exceed backlog capacity, data lost",
            );
        }
        for epoch in &applied.enqueued {
            info!(cluster = %self.cluster, epoch, "epoch incomplete, queued for catch-up");
        }
        for epoch in &applied.evicted {
            warn!(
                cluster = %self.cluster,
                epoch,
                "backlog epoch evicted, data lost",
            );
        }
        if let Some(epoch) = applied.recovered {
            info!(cluster = %self.cluster, epoch, "recovered backlog epoch");
        }
        for leaf in &unassigned {
            warn!(
                cluster = %self.cluster,
                kind = %leaf.kind,
                id = %leaf.id,
                "no parent in topology, excluded from storage group",
            );
        }

        report.enqueued = applied.enqueued;
        report.evicted = applied.evicted;
        report.recovered = applied.recovered;
        report.overflowed = applied.overflow.map_or(0, |o| o.count);
        report.unassigned = unassigned.len();
        report
    }

    /// Computes metrics for an arbitrary epoch without consulting or
    /// changing any collection state.
    ///
    /// Returns `None` when no entity has a valid pair for `epoch`.
    pub async fn collect_at(&self, epoch: Epoch) -> Result<Option<MetricBatch>> {
        let (listing, topology) = join(self.source.list_dumps(), self.source.topology()).await;
        let listing = listing.context("listing dumps")?;
        let topology = topology.context("loading topology")?;

        let catalog = Catalog::classify(listing.iter().map(String::as_str), &self.dump_kinds);
        if catalog.record(epoch).is_none() {
            bail!("no dumps found for epoch {epoch}");
        }

        let fetched = self.fetch(&catalog, epoch, &HashSet::new()).await?;
        let mut scratch = SnapshotCache::new(self.interval);
        load(&mut scratch, &fetched);

        let mut unassigned = BTreeSet::new();
        let batch = self.aggregate(&scratch, &topology, epoch, &mut unassigned);
        if !unassigned.is_empty() {
            warn!(
                cluster = %self.cluster,
                count = unassigned.len(),
                "leaves without parent excluded from storage groups",
            );
        }
        Ok(batch)
    }

    /// Fetches every needed dump of `epoch`, plus the previous epoch's dump
    /// for slots not in `rotated`. Fetches run concurrently and all finish
    /// before this returns.
    async fn fetch(
        &self,
        catalog: &Catalog,
        epoch: Epoch,
        rotated: &HashSet<DumpSlot>,
    ) -> Result<Fetched> {
        let current_ids: Vec<DumpId> = catalog
            .dumps(epoch)
            .filter(|id| self.fetch_kinds.contains(&id.kind))
            .cloned()
            .collect();
        let previous_ids: Vec<DumpId> = current_ids
            .iter()
            .filter(|id| !rotated.contains(&id.slot()))
            .filter_map(|id| DumpId::for_epoch(id.kind, id.node.clone(), epoch - self.interval))
            .collect();

        let (current, previous) = join(
            join_all(current_ids.iter().map(|id| self.source.fetch_dump(id))),
            join_all(previous_ids.iter().map(|id| self.source.fetch_dump(id))),
        )
        .await;

        let mut fetched = Fetched {
            epoch,
            current: Vec::with_capacity(current_ids.len()),
            previous: Vec::with_capacity(previous_ids.len()),
        };

        for (id, result) in current_ids.into_iter().zip(current) {
            match result.with_context(|| format!("fetching dump {id}"))? {
                Some(dump) => fetched.current.push((id, dump)),
                None => bail!("dump {id} is no longer available"),
            }
        }

        for (id, result) in previous_ids.into_iter().zip(previous) {
            match result.with_context(|| format!("fetching dump {id}"))? {
                Some(dump) => fetched.previous.push((id, dump)),
                None => {
                    debug!(cluster = %self.cluster, dump = %id, "previous dump unavailable, deltas skipped for its entities");
                }
            }
        }

        Ok(fetched)
    }

    fn aggregate(
        &self,
        cache: &SnapshotCache,
        topology: &Topology,
        epoch: Epoch,
        unassigned: &mut BTreeSet<Unassigned>,
    ) -> Option<MetricBatch> {
        let mut agg = Aggregator::new(&self.rules, topology, self.interval);
        for snapshot in cache.snapshots() {
            agg.add(snapshot);
        }

        if agg.pair_count() == 0 {
            info!(
                cluster = %self.cluster,
                epoch,
                entities = agg.contributor_count(),
                "no entity has a previous snapshot, nothing to report",
            );
            return None;
        }

        unassigned.extend(agg.unassigned().cloned());
        Some(agg.finish(&self.cluster, epoch))
    }
}

fn stalled(reason: String) -> PollReport {
    PollReport::new(PollOutcome::Stalled { reason })
}

/// Commits fetched dumps into `cache`: the previous epoch first so the
/// current epoch rotates onto it.
fn load(cache: &mut SnapshotCache, fetched: &Fetched) {
    let previous_epoch = fetched.epoch - cache.interval();
    for (id, dump) in &fetched.previous {
        commit_dump(cache, id, dump, previous_epoch);
    }
    for (id, dump) in &fetched.current {
        commit_dump(cache, id, dump, fetched.epoch);
    }
}

fn commit_dump(cache: &mut SnapshotCache, id: &DumpId, dump: &Dump, epoch: Epoch) {
    let carried = id.kind.entity_kinds();
    for (kind, entity, counters) in dump.counter_sets() {
        if !carried.contains(&kind) {
            debug!(dump = %id, kind = %kind, id = entity, "ignoring entity of unexpected kind");
            continue;
        }
        cache.commit(SnapshotKey::new(id.node.as_str(), kind, entity), epoch, counters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::format_stamp;
    use crate::config::SourceConfig;
    use crate::source::DumpEntry;
    use crate::snapshot::EntityKind;
    use std::collections::BTreeMap;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct MemorySource {
        dumps: Mutex<BTreeMap<String, Dump>>,
        topology: Topology,
    }

    impl SnapshotSource for MemorySource {
        async fn list_dumps(&self) -> Result<Vec<String>> {
            Ok(self.dumps.lock().keys().cloned().collect())
        }

        async fn fetch_dump(&self, id: &DumpId) -> Result<Option<Dump>> {
            Ok(self.dumps.lock().get(&id.file_name()).cloned())
        }
    }

    impl TopologySource for MemorySource {
        async fn topology(&self) -> Result<Topology> {
            Ok(self.topology.clone())
        }
    }

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            name: "svc01".into(),
            expected_nodes: Some(1),
            dump_kinds: vec![DumpKind::Volume],
            metrics: MetricsConfig {
                node: vec![],
                storage_group: vec![],
                volume: vec![crate::metrics::rule::MetricRule::rate(
                    "read_io_rate",
                    EntityKind::Volume,
                    "ro",
                    1.0,
                )],
                extent: vec![],
                port: vec![],
            },
            source: SourceConfig {
                spool_dir: PathBuf::from("/unused"),
                topology_file: None,
            },
            ..Default::default()
        }
    }

    fn put(source: &MemorySource, epoch: Epoch, ro: u64) {
        let stamp = format_stamp(epoch).expect("in range");
        let dump = Dump {
            entries: vec![DumpEntry {
                kind: EntityKind::Volume,
                id: "v0".into(),
                counters: [("ro".to_string(), ro)].into_iter().collect(),
            }],
        };
        source
            .dumps
            .lock()
            .insert(format!("Nv_stats_n1_{stamp}"), dump);
    }

    const T0: Epoch = 1_710_497_700;

    #[tokio::test]
    async fn test_first_poll_without_previous_emits_nothing() {
        let source = MemorySource::default();
        put(&source, T0, 10);
        let engine = Engine::new(&cluster(), source);
        let mut state = CollectionState::new(&cluster());

        let report = engine.poll(&mut state).await;
        assert_eq!(report.outcome, PollOutcome::Processed);
        assert!(report.batches.is_empty());
        assert_eq!(state.current_epoch(), T0);
    }

    #[tokio::test]
    async fn test_stalled_when_nothing_complete() {
        let engine = Engine::new(&cluster(), MemorySource::default());
        let mut state = CollectionState::new(&cluster());
        let report = engine.poll(&mut state).await;
        assert!(matches!(report.outcome, PollOutcome::Stalled { .. }));
        assert_eq!(state.phase(), Phase::Stalled);
        assert_eq!(state.current_epoch(), 0);
    }

    #[tokio::test]
    async fn test_first_poll_with_previous_emits_batch() {
        let source = MemorySource::default();
        put(&source, T0, 10);
        put(&source, T0 + 60, 130);
        let engine = Engine::new(&cluster(), source);
        let mut state = CollectionState::new(&cluster());

        let report = engine.poll(&mut state).await;
        assert_eq!(report.batches.len(), 1);
        let batch = &report.batches[0];
        assert_eq!(batch.epoch, T0 + 60);
        assert_eq!(
            batch
                .record(EntityKind::Volume, "v0")
                .and_then(|r| r.get("read_io_rate")),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_collect_at_leaves_state_alone() {
        let source = MemorySource::default();
        put(&source, T0, 0);
        put(&source, T0 + 60, 60);
        let engine = Engine::new(&cluster(), source);
        let state = CollectionState::new(&cluster());

        let batch = engine
            .collect_at(T0 + 60)
            .await
            .expect("collect")
            .expect("pair available");
        assert_eq!(batch.epoch, T0 + 60);
        assert_eq!(state.current_epoch(), 0);
        assert!(state.cache().is_empty());

        assert!(engine.collect_at(T0).await.expect("collect").is_none());
        assert!(engine.collect_at(T0 + 600).await.is_err());
    }
}
