use crate::snapshot::CounterSet;

/// Difference of `counter` between two snapshots.
///
/// A counter that went backwards (node reboot, counter wrap) is reported as 0.
/// A counter missing from either side is 0.
pub fn counter_delta(old: &CounterSet, new: &CounterSet, counter: &str) -> u64 {
    match (old.get(counter), new.get(counter)) {
        (Some(old), Some(new)) => new.saturating_sub(old),
        _ => 0,
    }
}

/// Sum over several counters, saturating.
pub fn sum_deltas<'a, I>(old: &CounterSet, new: &CounterSet, counters: I) -> u64
where
    I: IntoIterator<Item = &'a String>,
{
    counters
        .into_iter()
        .fold(0u64, |acc, c| acc.saturating_add(counter_delta(old, new, c)))
}

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
