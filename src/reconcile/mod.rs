pub mod backlog;

use std::fmt;

use crate::catalog::Catalog;
use crate::snapshot::Epoch;

pub use backlog::{Backlog, BacklogEntry, BacklogReview};

/// Reconciler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No complete epoch consumed yet.
    Initial,
    Steady,
    /// Backlog is non-empty.
    CatchingUp,
    /// Last poll could not make progress; retried on the next poll.
    Stalled,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Steady => "steady",
            Self::CatchingUp => "catching_up",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run of skipped epochs older than the backlog can hold. They are dropped
/// without ever being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub first: Epoch,
    pub last: Epoch,
    pub count: u64,
}

/// Decisions for one poll, computed without touching reconciler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Newly complete epoch to advance to.
    pub forward: Option<Epoch>,
    /// Skipped intermediate epochs to queue for retry, at most the backlog
    /// capacity, newest kept.
    pub enqueue: Vec<Epoch>,
    /// Skipped epochs that did not fit in `enqueue`.
    pub overflow: Option<Overflow>,
    /// Backlog epoch to replay this poll.
    pub replay: Option<Epoch>,
    /// Backlog epochs that passed the eviction bound.
    pub evict: Vec<Epoch>,
    misses: Vec<(Epoch, u32)>,
}

/// Outcome of committing a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Epochs that were actually queued (already queued ones excluded).
    pub enqueued: Vec<Epoch>,
    /// Epochs dropped without processing, by eviction or queue overflow.
    pub evicted: Vec<Epoch>,
    pub recovered: Option<Epoch>,
    /// Skipped epochs dropped without being queued.
    pub overflow: Option<Overflow>,
}

/// Timestamp state machine for one cluster.
#[derive(Debug, Clone)]
pub struct Reconciler {
    interval: i64,
    current_epoch: Epoch,
    last_consumed_epoch: Epoch,
    phase: Phase,
    backlog: Backlog,
}

impl Reconciler {
    pub fn new(interval: i64, eviction_bound: u32, max_entries: usize) -> Self {
        Self {
            interval,
            current_epoch: 0,
            last_consumed_epoch: 0,
            phase: Phase::Initial,
            backlog: Backlog::new(eviction_bound, max_entries),
        }
    }

    /// Latest epoch consumed by a forward step; 0 before the first.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    /// Epoch of the most recently processed batch, forward or replayed.
    pub fn last_consumed_epoch(&self) -> Epoch {
        self.last_consumed_epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Decides what this poll should process.
    pub fn plan(&self, catalog: &Catalog, expected: u32) -> Plan {
        let mut plan = Plan::default();

        if let Some(latest) = catalog.latest_complete(expected) {
            if self.current_epoch == 0 {
                plan.forward = Some(latest);
            } else if latest > self.current_epoch {
                let step = self.interval.max(1);
                let gap = (latest - self.current_epoch - 1) / step;
                let room = i64::try_from(self.backlog.max_entries()).unwrap_or(i64::MAX);
                let skipped = gap - gap.min(room);
                if skipped > 0 {
                    plan.overflow = Some(Overflow {
                        first: self.current_epoch + step,
                        last: self.current_epoch + skipped * step,
                        count: u64::try_from(skipped).unwrap_or(0),
                    });
                }

                let mut missed = self.current_epoch + (skipped + 1) * step;
                while missed < latest {
                    plan.enqueue.push(missed);
                    missed += step;
                }
                plan.forward = Some(latest);
            }
        }

        // Newly skipped epochs are reviewed together with older entries so an
        // intermediate epoch that is already complete is replayed right away.
        let mut pending = self.backlog.clone();
        for epoch in &plan.enqueue {
            pending.push(*epoch);
        }
        let review = pending.review(catalog, expected);
        plan.replay = review.ready;
        plan.evict = review.evicted;
        plan.misses = review.misses;

        plan
    }

    /// Commits a plan after its work finished.
    ///
    /// `replayed` is false when the replay in `plan` could not be completed;
    /// the entry then stays queued.
    pub fn commit(&mut self, plan: &Plan, replayed: bool) -> Applied {
        let mut applied = Applied {
            overflow: plan.overflow,
            ..Default::default()
        };

        for epoch in &plan.enqueue {
            if self.backlog.contains(*epoch) {
                continue;
            }
            if let Some(dropped) = self.backlog.push(*epoch) {
                applied.evicted.push(dropped);
            }
            if self.backlog.contains(*epoch) {
                applied.enqueued.push(*epoch);
            }
        }

        self.backlog.apply(&BacklogReview {
            ready: None,
            evicted: plan.evict.clone(),
            misses: plan.misses.clone(),
        });
        applied.evicted.extend(plan.evict.iter().copied());

        if let Some(epoch) = plan.forward {
            self.current_epoch = epoch;
            self.last_consumed_epoch = epoch;
        }

        if let Some(epoch) = plan.replay.filter(|_| replayed) {
            if self.backlog.remove(epoch) {
                self.last_consumed_epoch = epoch;
                applied.recovered = Some(epoch);
            }
        }

        self.phase = if self.current_epoch == 0 {
            Phase::Initial
        } else if self.backlog.is_empty() {
            Phase::Steady
        } else {
            Phase::CatchingUp
        };

        applied
    }

    /// Marks the last poll as unable to progress. Nothing else changes.
    pub fn stall(&mut self) {
        self.phase = Phase::Stalled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{format_stamp, DumpKind};

    const BASE: Epoch = 1_710_497_700;

    fn at(step: i64) -> Epoch {
        BASE + step * 60
    }

    fn catalog(complete: &[Epoch], partial: &[Epoch]) -> Catalog {
        let mut names = Vec::new();
        for epoch in complete {
            let stamp = format_stamp(*epoch).expect("in range");
            names.push(format!("Nv_stats_n1_{stamp}"));
            names.push(format!("Nm_stats_n1_{stamp}"));
        }
        for epoch in partial {
            let stamp = format_stamp(*epoch).expect("in range");
            names.push(format!("Nm_stats_n1_{stamp}"));
        }
        Catalog::classify(
            names.iter().map(String::as_str),
            &[DumpKind::Volume, DumpKind::Extent],
        )
    }

    #[test]
    fn test_initial_takes_latest_complete() {
        let mut rec = Reconciler::new(60, 15, 64);
        let plan = rec.plan(&catalog(&[at(0), at(1)], &[at(2)]), 2);
        assert_eq!(plan.forward, Some(at(1)));
        assert!(plan.enqueue.is_empty());

        rec.commit(&plan, false);
        assert_eq!(rec.current_epoch(), at(1));
        assert_eq!(rec.phase(), Phase::Steady);
    }

    #[test]
    fn test_no_complete_epoch_has_no_work() {
        let rec = Reconciler::new(60, 15, 64);
        let plan = rec.plan(&catalog(&[], &[at(0)]), 2);
        assert_eq!(plan, Plan::default());
    }

    #[test]
    fn test_next_interval_advances() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);

        let plan = rec.plan(&catalog(&[at(0), at(1)], &[]), 2);
        assert_eq!(plan.forward, Some(at(1)));
        assert!(plan.enqueue.is_empty());
    }

    #[test]
    fn test_stale_latest_skips_poll() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(1)], &[]), 2), false);

        let plan = rec.plan(&catalog(&[at(0), at(1)], &[at(2)]), 2);
        assert_eq!(plan.forward, None);
        assert_eq!(plan.replay, None);
    }

    #[test]
    fn test_gap_enqueues_missed_epochs() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);

        let plan = rec.plan(&catalog(&[at(0), at(3)], &[at(1)]), 2);
        assert_eq!(plan.forward, Some(at(3)));
        assert_eq!(plan.enqueue, vec![at(1), at(2)]);
        assert_eq!(plan.replay, None);

        let applied = rec.commit(&plan, false);
        assert_eq!(applied.enqueued, vec![at(1), at(2)]);
        assert_eq!(rec.current_epoch(), at(3));
        assert_eq!(rec.phase(), Phase::CatchingUp);
        assert_eq!(rec.backlog().len(), 2);
    }

    #[test]
    fn test_long_outage_queues_only_newest_gap() {
        let mut rec = Reconciler::new(60, 15, 4);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);

        let plan = rec.plan(&catalog(&[at(0), at(1_000)], &[]), 2);
        assert_eq!(plan.forward, Some(at(1_000)));
        assert_eq!(plan.enqueue, vec![at(996), at(997), at(998), at(999)]);
        assert_eq!(
            plan.overflow,
            Some(Overflow {
                first: at(1),
                last: at(995),
                count: 995,
            })
        );

        let applied = rec.commit(&plan, false);
        assert_eq!(applied.enqueued.len(), 4);
        assert!(applied.evicted.is_empty());
        assert_eq!(applied.overflow.map(|o| o.count), Some(995));
        assert_eq!(rec.backlog().len(), 4);
    }

    #[test]
    fn test_complete_intermediate_replayed_same_poll() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);

        let plan = rec.plan(&catalog(&[at(0), at(1), at(2)], &[]), 2);
        assert_eq!(plan.forward, Some(at(2)));
        assert_eq!(plan.replay, Some(at(1)));

        let applied = rec.commit(&plan, true);
        assert_eq!(applied.recovered, Some(at(1)));
        assert!(rec.backlog().is_empty());
        assert_eq!(rec.phase(), Phase::Steady);
        assert_eq!(rec.last_consumed_epoch(), at(1));
        assert_eq!(rec.current_epoch(), at(2));
    }

    #[test]
    fn test_failed_replay_stays_queued() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);
        let plan = rec.plan(&catalog(&[at(0), at(1), at(2)], &[]), 2);

        let applied = rec.commit(&plan, false);
        assert_eq!(applied.recovered, None);
        assert!(rec.backlog().contains(at(1)));
    }

    #[test]
    fn test_plan_is_pure() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);
        let cat = catalog(&[at(0), at(3)], &[]);

        let first = rec.plan(&cat, 2);
        let second = rec.plan(&cat, 2);
        assert_eq!(first, second);
        assert_eq!(rec.current_epoch(), at(0));
        assert!(rec.backlog().is_empty());
    }

    #[test]
    fn test_stall_keeps_progress() {
        let mut rec = Reconciler::new(60, 15, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);
        rec.stall();
        assert_eq!(rec.phase(), Phase::Stalled);
        assert_eq!(rec.current_epoch(), at(0));
    }

    #[test]
    fn test_backlog_eviction_after_bound() {
        let mut rec = Reconciler::new(60, 3, 64);
        rec.commit(&rec.plan(&catalog(&[at(0)], &[]), 2), false);
        rec.commit(&rec.plan(&catalog(&[at(0), at(2)], &[at(1)]), 2), false);
        assert!(rec.backlog().contains(at(1)));

        let plan = rec.plan(&catalog(&[at(2), at(3), at(4)], &[at(1)]), 2);
        assert_eq!(plan.evict, vec![at(1)]);
        assert_eq!(plan.replay, Some(at(3)));
        let applied = rec.commit(&plan, true);
        assert_eq!(applied.evicted, vec![at(1)]);
        assert!(rec.backlog().is_empty());

        // Completing afterwards does not bring it back.
        let plan = rec.plan(&catalog(&[at(1), at(2), at(3), at(4)], &[]), 2);
        assert_eq!(plan.replay, None);
    }
}
