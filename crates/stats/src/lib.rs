//! Per-plan-node statistics aggregation across task attempts.
//!
//! Retried attempts produce a second measurement for the same logical
//! operator; this crate folds per-attempt [`OperatorStatsSnapshot`]s into one
//! cumulative [`PlanNodeStats`] per plan node. All merging happens on
//! additively-mergeable sums, so the result is independent of the order or
//! grouping in which attempt snapshots arrive.
//!
//! Key modules:
//! - [`snapshot`]: per-attempt measurement types and the merge itself
//! - [`aggregator`]: thread-safe accumulation keyed by plan node

pub mod aggregator;
pub mod snapshot;

pub use aggregator::StatsAggregator;
pub use snapshot::{OperatorHashCollisions, OperatorStatsSnapshot, PlanNodeStats};
