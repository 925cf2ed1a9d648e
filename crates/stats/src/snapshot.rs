//! Per-attempt operator measurements and the cumulative merge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Weighted hash-collision sums for one operator within a plan node.
///
/// Averages and standard deviations are derived later from these sums;
/// the sums themselves merge by plain addition, which keeps the merge
/// associative and commutative. Prior averages are never re-averaged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorHashCollisions {
    /// Weighted sum of observed hash collisions.
    pub weighted_collisions: f64,
    /// Weighted sum of squared observed hash collisions.
    pub weighted_sum_squared_collisions: f64,
    /// Weighted sum of expected hash collisions for an ideal hash.
    pub weighted_expected_collisions: f64,
    /// Total weight, i.e. input positions observed by the operator.
    pub input_positions: f64,
}

impl OperatorHashCollisions {
    pub fn add(&mut self, other: &OperatorHashCollisions) {
        self.weighted_collisions += other.weighted_collisions;
        self.weighted_sum_squared_collisions += other.weighted_sum_squared_collisions;
        self.weighted_expected_collisions += other.weighted_expected_collisions;
        self.input_positions += other.input_positions;
    }
}

/// Final per-plan-node measurement reported by one task attempt.
///
/// Only snapshots from attempts that reached terminal success are merged;
/// partial snapshots from failed attempts would double-count work redone
/// by the replacement attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorStatsSnapshot {
    /// Wall time the node was scheduled, in nanoseconds.
    pub scheduled_nanos: u64,
    /// CPU time consumed by the node, in nanoseconds.
    pub cpu_nanos: u64,
    /// Time the node spent blocked, in nanoseconds.
    pub blocked_nanos: u64,
    /// Input rows consumed.
    pub input_rows: u64,
    /// Input bytes consumed.
    pub input_bytes: u64,
    /// Output rows produced.
    pub output_rows: u64,
    /// Output bytes produced.
    pub output_bytes: u64,
    /// Bytes spilled to disk.
    pub spilled_bytes: u64,
    /// Operator-specific weighted collision sums, keyed by operator name.
    ///
    /// Optional extension: nodes without hash operators carry an empty map.
    pub hash_collisions: HashMap<String, OperatorHashCollisions>,
}

/// Cumulative merged record for one plan node across all attempts so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanNodeStats {
    /// Wall time the node was scheduled, in nanoseconds.
    pub scheduled_nanos: u64,
    /// CPU time consumed by the node, in nanoseconds.
    pub cpu_nanos: u64,
    /// Time the node spent blocked, in nanoseconds.
    pub blocked_nanos: u64,
    /// Input rows consumed.
    pub input_rows: u64,
    /// Input bytes consumed.
    pub input_bytes: u64,
    /// Output rows produced.
    pub output_rows: u64,
    /// Output bytes produced.
    pub output_bytes: u64,
    /// Bytes spilled to disk.
    pub spilled_bytes: u64,
    /// Merged operator-specific weighted collision sums.
    pub hash_collisions: HashMap<String, OperatorHashCollisions>,
    /// Number of attempt snapshots merged into this record.
    pub merged_snapshots: u64,
}

impl PlanNodeStats {
    /// Folds one attempt snapshot into the cumulative record.
    pub fn merge_snapshot(&mut self, snapshot: &OperatorStatsSnapshot) {
        self.scheduled_nanos += snapshot.scheduled_nanos;
        self.cpu_nanos += snapshot.cpu_nanos;
        self.blocked_nanos += snapshot.blocked_nanos;
        self.input_rows += snapshot.input_rows;
        self.input_bytes += snapshot.input_bytes;
        self.output_rows += snapshot.output_rows;
        self.output_bytes += snapshot.output_bytes;
        self.spilled_bytes += snapshot.spilled_bytes;
        for (operator, sums) in &snapshot.hash_collisions {
            self.hash_collisions
                .entry(operator.clone())
                .or_default()
                .add(sums);
        }
        self.merged_snapshots += 1;
    }

    /// Average observed hash collisions per input position, by operator.
    ///
    /// Operators with zero total weight are omitted: their average is
    /// undefined rather than NaN.
    pub fn operator_hash_collision_averages(&self) -> HashMap<String, f64> {
        self.hash_collisions
            .iter()
            .filter(|(_, s)| s.input_positions > 0.0)
            .map(|(op, s)| (op.clone(), s.weighted_collisions / s.input_positions))
            .collect()
    }

    /// Standard deviation of observed hash collisions, by operator.
    ///
    /// Zero-weight operators are omitted.
    pub fn operator_hash_collision_std_devs(&self) -> HashMap<String, f64> {
        self.hash_collisions
            .iter()
            .filter(|(_, s)| s.input_positions > 0.0)
            .map(|(op, s)| {
                (
                    op.clone(),
                    weighted_std_dev(
                        s.weighted_sum_squared_collisions,
                        s.weighted_collisions,
                        s.input_positions,
                    ),
                )
            })
            .collect()
    }

    /// Average expected hash collisions per input position, by operator.
    ///
    /// Zero-weight operators are omitted.
    pub fn operator_expected_collision_averages(&self) -> HashMap<String, f64> {
        self.hash_collisions
            .iter()
            .filter(|(_, s)| s.input_positions > 0.0)
            .map(|(op, s)| {
                (
                    op.clone(),
                    s.weighted_expected_collisions / s.input_positions,
                )
            })
            .collect()
    }
}

fn weighted_std_dev(sum_squared: f64, sum: f64, total_weight: f64) -> f64 {
    let average = sum / total_weight;
    let variance = (sum_squared - 2.0 * sum * average) / total_weight + average * average;
    // variance might be negative because of numeric inaccuracy
    variance.max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{weighted_std_dev, OperatorHashCollisions, OperatorStatsSnapshot, PlanNodeStats};

    fn collisions(sum: f64, sum_sq: f64, expected: f64, weight: f64) -> OperatorHashCollisions {
        OperatorHashCollisions {
            weighted_collisions: sum,
            weighted_sum_squared_collisions: sum_sq,
            weighted_expected_collisions: expected,
            input_positions: weight,
        }
    }

    fn snapshot(rows: u64, sum: f64, sum_sq: f64, weight: f64) -> OperatorStatsSnapshot {
        let mut s = OperatorStatsSnapshot {
            input_rows: rows,
            output_rows: rows,
            cpu_nanos: 1_000,
            ..OperatorStatsSnapshot::default()
        };
        s.hash_collisions
            .insert("HashJoin".to_string(), collisions(sum, sum_sq, sum / 2.0, weight));
        s
    }

    #[test]
    fn additive_fields_sum() {
        let mut stats = PlanNodeStats::default();
        stats.merge_snapshot(&snapshot(10, 4.0, 8.0, 10.0));
        stats.merge_snapshot(&snapshot(5, 2.0, 3.0, 5.0));
        assert_eq!(stats.input_rows, 15);
        assert_eq!(stats.cpu_nanos, 2_000);
        assert_eq!(stats.merged_snapshots, 2);
        let joined = stats.hash_collisions["HashJoin"];
        assert_eq!(joined.weighted_collisions, 6.0);
        assert_eq!(joined.input_positions, 15.0);
    }

    #[test]
    fn merge_is_order_independent() {
        let snaps = vec![
            snapshot(10, 4.0, 8.0, 10.0),
            snapshot(5, 2.0, 3.0, 5.0),
            snapshot(0, 0.0, 0.0, 0.0),
            snapshot(7, 9.5, 21.25, 7.0),
        ];

        let mut forward = PlanNodeStats::default();
        for s in &snaps {
            forward.merge_snapshot(s);
        }
        let mut backward = PlanNodeStats::default();
        for s in snaps.iter().rev() {
            backward.merge_snapshot(s);
        }

        assert_eq!(forward.input_rows, backward.input_rows);
        let fwd = forward.operator_hash_collision_averages()["HashJoin"];
        let bwd = backward.operator_hash_collision_averages()["HashJoin"];
        assert!((fwd - bwd).abs() < 1e-12);
        let fwd_dev = forward.operator_hash_collision_std_devs()["HashJoin"];
        let bwd_dev = backward.operator_hash_collision_std_devs()["HashJoin"];
        assert!((fwd_dev - bwd_dev).abs() < 1e-12);
    }

    #[test]
    fn std_dev_is_never_negative_under_float_error() {
        // Constant metric: exact variance is zero, but the raw identity can
        // dip below zero for large magnitudes.
        let weight = 3.0_f64;
        let value = 1e8_f64 + 0.1;
        let sum = value * weight;
        let sum_sq = value * value * weight;
        let dev = weighted_std_dev(sum_sq, sum, weight);
        assert!(dev >= 0.0);
        assert!(dev.is_finite());
    }

    #[test]
    fn zero_weight_operators_are_undefined_not_nan() {
        let mut stats = PlanNodeStats::default();
        stats.merge_snapshot(&snapshot(0, 0.0, 0.0, 0.0));
        assert!(stats.operator_hash_collision_averages().is_empty());
        assert!(stats.operator_hash_collision_std_devs().is_empty());
        assert!(stats.operator_expected_collision_averages().is_empty());

        // Weight arriving later makes the metric defined.
        stats.merge_snapshot(&snapshot(4, 2.0, 1.0, 4.0));
        let avg = stats.operator_hash_collision_averages()["HashJoin"];
        assert!((avg - 0.5).abs() < 1e-12);
    }

    #[test]
    fn std_dev_matches_direct_computation() {
        // Two positions with metric 1.0 and 3.0: avg 2.0, variance 1.0.
        let sums = collisions(4.0, 10.0, 0.0, 2.0);
        let dev = weighted_std_dev(
            sums.weighted_sum_squared_collisions,
            sums.weighted_collisions,
            sums.input_positions,
        );
        assert!((dev - 1.0).abs() < 1e-12);
    }
}
