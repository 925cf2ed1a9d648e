//! Thread-safe accumulation of attempt snapshots keyed by plan node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use ftq_common::PlanNodeId;

use crate::snapshot::{OperatorStatsSnapshot, PlanNodeStats};

/// Accumulates [`OperatorStatsSnapshot`]s into one [`PlanNodeStats`] per
/// logical plan node.
///
/// Concurrency: node records live behind their own locks in a two-level
/// map, so merges for different nodes never contend and concurrent merges
/// for the same node serialize through that node's lock alone. Because the
/// merge is associative and commutative, the serialization order does not
/// affect the result.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    nodes: RwLock<HashMap<PlanNodeId, Arc<Mutex<PlanNodeStats>>>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `snapshot` into the node's cumulative record and returns the
    /// updated record.
    pub fn merge(&self, node: PlanNodeId, snapshot: &OperatorStatsSnapshot) -> PlanNodeStats {
        let entry = self.node_entry(node);
        let mut stats = entry.lock().expect("plan node stats lock");
        stats.merge_snapshot(snapshot);
        stats.clone()
    }

    /// Current cumulative record for `node`, if any snapshot arrived.
    pub fn node_stats(&self, node: PlanNodeId) -> Option<PlanNodeStats> {
        let nodes = self.nodes.read().expect("stats registry lock");
        nodes
            .get(&node)
            .map(|entry| entry.lock().expect("plan node stats lock").clone())
    }

    /// Snapshot of every node's cumulative record, for plan-explain output.
    pub fn all_node_stats(&self) -> HashMap<PlanNodeId, PlanNodeStats> {
        let nodes = self.nodes.read().expect("stats registry lock");
        nodes
            .iter()
            .map(|(id, entry)| (*id, entry.lock().expect("plan node stats lock").clone()))
            .collect()
    }

    /// Per-operator average observed hash collisions for `node`.
    pub fn operator_hash_collision_averages(&self, node: PlanNodeId) -> HashMap<String, f64> {
        self.node_stats(node)
            .map(|s| s.operator_hash_collision_averages())
            .unwrap_or_default()
    }

    /// Per-operator hash-collision standard deviations for `node`.
    pub fn operator_hash_collision_std_devs(&self, node: PlanNodeId) -> HashMap<String, f64> {
        self.node_stats(node)
            .map(|s| s.operator_hash_collision_std_devs())
            .unwrap_or_default()
    }

    /// Per-operator average expected hash collisions for `node`.
    pub fn operator_expected_collision_averages(&self, node: PlanNodeId) -> HashMap<String, f64> {
        self.node_stats(node)
            .map(|s| s.operator_expected_collision_averages())
            .unwrap_or_default()
    }

    fn node_entry(&self, node: PlanNodeId) -> Arc<Mutex<PlanNodeStats>> {
        {
            let nodes = self.nodes.read().expect("stats registry lock");
            if let Some(entry) = nodes.get(&node) {
                return Arc::clone(entry);
            }
        }
        let mut nodes = self.nodes.write().expect("stats registry lock");
        Arc::clone(nodes.entry(node).or_default())
    }
}
