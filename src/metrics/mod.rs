//! Derived metrics: rules, counter deltas and per-level aggregation.

pub mod aggregate;
pub mod delta;
pub mod record;
pub mod rule;
