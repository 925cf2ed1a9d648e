//! Spool addressing and the sealed-output index.
//!
//! Spooled data is addressed by `(query, stage, producing attempt,
//! partition)`; every partition file is independently readable without any
//! other partition being present. Backends treat these paths as opaque
//! relative keys.

use ftq_common::{QueryId, StageId};
use serde::{Deserialize, Serialize};

pub fn query_dir(query: QueryId) -> String {
    format!("exchange/{query}")
}

pub fn stage_dir(query: QueryId, stage: StageId) -> String {
    format!("exchange/{query}/{stage}")
}

pub fn attempt_dir(query: QueryId, stage: StageId, attempt: u32) -> String {
    format!("exchange/{query}/{stage}/{attempt}")
}

pub fn partition_path(query: QueryId, stage: StageId, attempt: u32, partition: u32) -> String {
    format!("{}/part-{partition}.bin", attempt_dir(query, stage, attempt))
}

pub fn index_path(query: QueryId, stage: StageId, attempt: u32) -> String {
    format!("{}/index.json", attempt_dir(query, stage, attempt))
}

/// Metadata for one spooled partition within a sealed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpooledPartitionMeta {
    /// Partition key this spooled output belongs to.
    pub partition: u32,
    /// Backend-relative file path.
    pub file: String,
    /// File size in bytes.
    pub bytes: u64,
    /// Number of byte batches framed inside the file.
    pub batches: u64,
}

/// Sealed-output manifest for one producing attempt.
///
/// Written last during seal; resolution always goes through the manager's
/// in-memory registry, so an attempt directory without a registry entry is
/// never exposed to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutputIndex {
    pub query: QueryId,
    pub stage: StageId,
    pub attempt: u32,
    pub partitions: Vec<SpooledPartitionMeta>,
}

impl StageOutputIndex {
    pub fn partition(&self, partition: u32) -> Option<&SpooledPartitionMeta> {
        self.partitions.iter().find(|p| p.partition == partition)
    }
}
