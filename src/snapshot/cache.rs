use std::collections::BTreeMap;

use super::{CounterSet, Epoch, SnapshotKey, SnapshotPair};

#[derive(Debug, Clone)]
struct Generation {
    epoch: Epoch,
    counters: CounterSet,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    old: Option<Generation>,
    new: Generation,
}

/// Result of committing a counter set for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Previous "new" became "old"; a delta pair is available.
    Rotated,
    /// No usable previous generation; the entity starts over with "new" only.
    Reset,
    /// Same epoch committed again; "new" replaced, "old" kept.
    Replaced,
}

/// Borrowed view of one cached entity.
#[derive(Debug, Clone, Copy)]
pub struct CachedSnapshot<'a> {
    pub key: &'a SnapshotKey,
    pub new: &'a CounterSet,
    pub new_epoch: Epoch,
    /// Present only when captured exactly one interval before `new`.
    pub old: Option<&'a CounterSet>,
}

/// Rolling two-generation cache of raw counters per entity.
///
/// Committing a counter set one interval after the entity's current "new"
/// rotates it into "old"; any other gap discards the stale generation so a
/// delta is never computed across a missed or replayed interval.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    interval: i64,
    entries: BTreeMap<SnapshotKey, CacheEntry>,
}

impl SnapshotCache {
    /// Creates an empty cache for the given sampling interval in seconds.
    pub fn new(interval: i64) -> Self {
        Self {
            interval,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the sampling interval in seconds.
    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Returns the snapshot pair for `key`, or `None` when the entity has no
    /// generation exactly one interval older than its newest.
    pub fn get(&self, key: &SnapshotKey) -> Option<SnapshotPair> {
        let entry = self.entries.get(key)?;
        let old = entry.old.as_ref()?;
        if entry.new.epoch - old.epoch != self.interval {
            return None;
        }
        Some(SnapshotPair {
            old: old.counters.clone(),
            new: entry.new.counters.clone(),
            old_epoch: old.epoch,
            new_epoch: entry.new.epoch,
        })
    }

    /// Records `counters` as the entity's state at `epoch`.
    pub fn commit(&mut self, key: SnapshotKey, epoch: Epoch, counters: CounterSet) -> Commit {
        let fresh = Generation { epoch, counters };

        match self.entries.get_mut(&key) {
            Some(entry) if entry.new.epoch + self.interval == epoch => {
                let previous = std::mem::replace(&mut entry.new, fresh);
                entry.old = Some(previous);
                Commit::Rotated
            }
            Some(entry) if entry.new.epoch == epoch => {
                entry.new = fresh;
                Commit::Replaced
            }
            Some(entry) => {
                entry.old = None;
                entry.new = fresh;
                Commit::Reset
            }
            None => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        old: None,
                        new: fresh,
                    },
                );
                Commit::Reset
            }
        }
    }

    /// Drops every entity whose newest generation is not `epoch` and returns
    /// the dropped keys. Used after a cycle to forget deleted entities.
    pub fn retain_epoch(&mut self, epoch: Epoch) -> Vec<SnapshotKey> {
        let dropped: Vec<SnapshotKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.new.epoch != epoch)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dropped {
            self.entries.remove(key);
        }
        dropped
    }

    /// Iterates all cached entities in key order.
    pub fn snapshots(&self) -> impl Iterator<Item = CachedSnapshot<'_>> {
        let interval = self.interval;
        self.entries.iter().map(move |(key, entry)| CachedSnapshot {
            key,
            new: &entry.new.counters,
            new_epoch: entry.new.epoch,
            old: entry
                .old
                .as_ref()
                .filter(|old| entry.new.epoch - old.epoch == interval)
                .map(|old| &old.counters),
        })
    }

    /// Number of entities with a usable delta pair.
    pub fn pair_count(&self) -> usize {
        self.snapshots().filter(|s| s.old.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
