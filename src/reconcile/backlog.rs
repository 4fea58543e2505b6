use std::collections::VecDeque;

use crate::catalog::Catalog;
use crate::snapshot::Epoch;

/// An epoch that was skipped because it was incomplete at poll time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogEntry {
    pub epoch: Epoch,
    /// Complete epochs observed strictly after this one while it stayed
    /// incomplete. Never decreases.
    pub misses: u32,
}

/// What a backlog review found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogReview {
    /// Oldest entry whose epoch is now complete.
    pub ready: Option<Epoch>,
    /// Entries that exceeded the eviction bound.
    pub evicted: Vec<Epoch>,
    /// Updated miss counts for entries that stay queued.
    pub misses: Vec<(Epoch, u32)>,
}

/// Bounded queue of epochs pending retry, kept in epoch order.
#[derive(Debug, Clone)]
pub struct Backlog {
    entries: VecDeque<BacklogEntry>,
    eviction_bound: u32,
    max_entries: usize,
}

impl Backlog {
    pub fn new(eviction_bound: u32, max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            eviction_bound: eviction_bound.max(1),
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Queues `epoch` unless already present. Returns the epoch dropped to
    /// make room when the queue is full.
    pub fn push(&mut self, epoch: Epoch) -> Option<Epoch> {
        let pos = match self.entries.binary_search_by_key(&epoch, |e| e.epoch) {
            Ok(_) => return None,
            Err(pos) => pos,
        };
        self.entries.insert(pos, BacklogEntry { epoch, misses: 0 });

        if self.entries.len() > self.max_entries {
            return self.entries.pop_front().map(|e| e.epoch);
        }
        None
    }

    pub fn remove(&mut self, epoch: Epoch) -> bool {
        match self.entries.binary_search_by_key(&epoch, |e| e.epoch) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        self.entries
            .binary_search_by_key(&epoch, |e| e.epoch)
            .is_ok()
    }

    /// Checks every entry against `catalog` without mutating the queue.
    ///
    /// A complete entry is a replay candidate; an incomplete one has its miss
    /// count raised to the number of complete epochs after it and is evicted
    /// once that count reaches the bound. Eviction is checked first, so an
    /// entry that completes too late is still dropped.
    pub fn review(&self, catalog: &Catalog, expected: u32) -> BacklogReview {
        let mut review = BacklogReview::default();

        for entry in &self.entries {
            let later = catalog.complete_after(entry.epoch, expected);
            let later = u32::try_from(later).unwrap_or(u32::MAX);
            let misses = if catalog.is_complete(entry.epoch, expected) {
                entry.misses
            } else {
                entry.misses.max(later)
            };

            if misses >= self.eviction_bound {
                review.evicted.push(entry.epoch);
                continue;
            }

            if catalog.is_complete(entry.epoch, expected) {
                if review.ready.is_none() {
                    review.ready = Some(entry.epoch);
                }
            } else if misses != entry.misses {
                review.misses.push((entry.epoch, misses));
            }
        }

        review
    }

    /// Applies the miss counts and evictions of a review.
    pub fn apply(&mut self, review: &BacklogReview) {
        for (epoch, misses) in &review.misses {
            if let Ok(pos) = self.entries.binary_search_by_key(epoch, |e| e.epoch) {
                self.entries[pos].misses = *misses;
            }
        }
        for epoch in &review.evicted {
            self.remove(*epoch);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BacklogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
