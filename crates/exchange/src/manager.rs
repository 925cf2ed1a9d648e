//! Exchange sinks, sources, handle resolution, and garbage collection.
//!
//! Visibility rules:
//! - nothing under an attempt directory is consumer-visible until the sink
//!   is sealed; resolution only goes through the in-memory registry, which
//!   is updated exclusively by [`ExchangeManager::seal_sink`];
//! - sealing a newer attempt supersedes the stage's prior sealed attempt;
//! - superseded output is deleted only once its consumer refcount is zero,
//!   or when the owning query terminates.
//!
//! Retry semantics:
//! - spooled output is keyed by `(query, stage, attempt, partition)`;
//! - a reader holding a handle to collected output gets
//!   [`FtqError::StaleExchange`], which the retry coordinator converts into
//!   a producer-side re-run, never a fatal failure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ftq_common::metrics::global_metrics;
use ftq_common::{AttemptId, CancellationFlag, FtqError, QueryId, Result, StageId};
use tracing::{debug, info, warn};

use crate::backend::ExchangeBackend;
use crate::layout::{
    attempt_dir, index_path, partition_path, query_dir, SpooledPartitionMeta, StageOutputIndex,
};

const SPOOL_MAGIC: &[u8; 4] = b"FTQX";
const SPOOL_VERSION: u32 = 1;
const SPOOL_HEADER_LEN: usize = 12;

/// Resolves to one sealed attempt's output for a producer stage.
///
/// The `generation` pins the exact sealed output the handle was resolved
/// against, so a reader can detect that its data was superseded and
/// collected while it was away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeHandle {
    pub query: QueryId,
    pub stage: StageId,
    pub attempt: u32,
    generation: u64,
}

struct SealedOutput {
    attempt: u32,
    generation: u64,
    index: StageOutputIndex,
    consumers: HashSet<AttemptId>,
}

#[derive(Default)]
struct StageExchange {
    current: Option<SealedOutput>,
    superseded: Vec<SealedOutput>,
    collected_generations: HashSet<u64>,
}

/// Durable hand-off layer between producing and consuming attempts.
pub struct ExchangeManager {
    backend: Arc<dyn ExchangeBackend>,
    registry: Mutex<HashMap<(QueryId, StageId), StageExchange>>,
    generations: AtomicU64,
}

impl ExchangeManager {
    pub fn new(backend: Arc<dyn ExchangeBackend>) -> Self {
        Self {
            backend,
            registry: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Opens a sink for one producing attempt.
    ///
    /// Partitions written through the sink stay invisible until
    /// [`Self::seal_sink`] succeeds; a dropped or aborted sink discards its
    /// partial output.
    pub fn open_sink(&self, query: QueryId, stage: StageId, attempt: u32) -> ExchangeSink {
        debug!(%query, %stage, attempt, "opening exchange sink");
        ExchangeSink {
            query,
            stage,
            attempt,
            backend: Arc::clone(&self.backend),
            partitions: Vec::new(),
            written: HashSet::new(),
            sealed: false,
        }
    }

    /// Finalizes a sink's output and installs it as the stage's current
    /// sealed attempt, superseding any prior one.
    ///
    /// # Errors
    /// Returns an error when the index cannot be persisted; the sink is
    /// consumed and its partial output discarded in that case.
    pub fn seal_sink(&self, mut sink: ExchangeSink) -> Result<ExchangeHandle> {
        let started = Instant::now();
        let mut partitions = std::mem::take(&mut sink.partitions);
        partitions.sort_by_key(|p| p.partition);
        let index = StageOutputIndex {
            query: sink.query,
            stage: sink.stage,
            attempt: sink.attempt,
            partitions,
        };
        let index_bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| FtqError::Execution(format!("exchange index encode failed: {e}")))?;
        self.backend
            .put(&index_path(sink.query, sink.stage, sink.attempt), &index_bytes)?;
        sink.sealed = true;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ExchangeHandle {
            query: sink.query,
            stage: sink.stage,
            attempt: sink.attempt,
            generation,
        };

        let mut registry = self.registry.lock().expect("exchange registry lock");
        let entry = registry
            .entry((sink.query, sink.stage))
            .or_insert_with(StageExchange::default);
        let sealed = SealedOutput {
            attempt: sink.attempt,
            generation,
            index,
            consumers: HashSet::new(),
        };
        if let Some(old) = entry.current.replace(sealed) {
            info!(
                query = %sink.query,
                stage = %sink.stage,
                old_attempt = old.attempt,
                new_attempt = sink.attempt,
                "sealed exchange output supersedes prior attempt"
            );
            entry.superseded.push(old);
        } else {
            info!(
                query = %sink.query,
                stage = %sink.stage,
                attempt = sink.attempt,
                "sealed exchange output"
            );
        }
        drop(registry);

        global_metrics().record_exchange_seal(
            &sink.query.to_string(),
            sink.stage.0,
            started.elapsed().as_secs_f64(),
        );
        Ok(handle)
    }

    /// Current sealed handle for a producer stage, if any.
    pub fn resolve(&self, query: QueryId, stage: StageId) -> Option<ExchangeHandle> {
        let registry = self.registry.lock().expect("exchange registry lock");
        registry.get(&(query, stage)).and_then(|entry| {
            entry.current.as_ref().map(|out| ExchangeHandle {
                query,
                stage,
                attempt: out.attempt,
                generation: out.generation,
            })
        })
    }

    /// Registers a consuming attempt against the handle's sealed output.
    ///
    /// # Errors
    /// Returns [`FtqError::StaleExchange`] when the output is already gone.
    pub fn add_consumer(&self, handle: &ExchangeHandle, consumer: AttemptId) -> Result<()> {
        let mut registry = self.registry.lock().expect("exchange registry lock");
        let output = Self::find_output_mut(&mut registry, handle)?;
        output.consumers.insert(consumer);
        Ok(())
    }

    /// Drops a consuming attempt's reference; used for GC refcounting.
    pub fn release(&self, handle: &ExchangeHandle, consumer: AttemptId) {
        let mut registry = self.registry.lock().expect("exchange registry lock");
        if let Ok(output) = Self::find_output_mut(&mut registry, handle) {
            output.consumers.remove(&consumer);
        }
    }

    /// Partition keys present in the handle's sealed output.
    ///
    /// # Errors
    /// Returns [`FtqError::StaleExchange`] when the output is already gone.
    pub fn handle_partitions(&self, handle: &ExchangeHandle) -> Result<Vec<u32>> {
        let mut registry = self.registry.lock().expect("exchange registry lock");
        let output = Self::find_output_mut(&mut registry, handle)?;
        Ok(output.index.partitions.iter().map(|p| p.partition).collect())
    }

    /// Opens a restartable reader over one spooled partition.
    ///
    /// Each call restarts from the first batch; concurrent readers against
    /// the same sealed output do not interfere.
    ///
    /// # Errors
    /// Returns [`FtqError::StaleExchange`] when the handle's output has been
    /// superseded and collected, or IO errors from the backend.
    pub fn open_source(
        &self,
        handle: &ExchangeHandle,
        partition: u32,
        cancel: CancellationFlag,
    ) -> Result<SpoolReader> {
        let meta = {
            let mut registry = self.registry.lock().expect("exchange registry lock");
            let output = Self::find_output_mut(&mut registry, handle)?;
            output.index.partition(partition).cloned().ok_or_else(|| {
                FtqError::Execution(format!(
                    "partition {partition} not found in sealed exchange output {}",
                    handle.attempt
                ))
            })?
        };

        let data = match self.backend.get(&meta.file) {
            Ok(data) => data,
            Err(FtqError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // The file can vanish to a concurrent GC sweep between the
                // registry check and the read. If the generation is gone
                // from the registry the read was stale, not fatal.
                let mut registry = self.registry.lock().expect("exchange registry lock");
                Self::find_output_mut(&mut registry, handle)?;
                return Err(FtqError::Io(e));
            }
            Err(e) => return Err(e),
        };
        global_metrics().record_exchange_read(
            &handle.query.to_string(),
            handle.stage.0,
            data.len() as u64,
        );
        SpoolReader::new(data, cancel)
    }

    /// Deletes superseded attempts whose consumer refcount has drained.
    ///
    /// Best-effort and idempotent: failed deletions are logged and retried
    /// on the next sweep. Returns the number of attempt directories removed.
    pub fn collect_garbage(&self) -> usize {
        let deletable: Vec<((QueryId, StageId), SealedOutput)> = {
            let mut registry = self.registry.lock().expect("exchange registry lock");
            let mut drained = Vec::new();
            for ((query, stage), entry) in registry.iter_mut() {
                let (ready, kept): (Vec<_>, Vec<_>) = entry
                    .superseded
                    .drain(..)
                    .partition(|out| out.consumers.is_empty());
                entry.superseded = kept;
                for out in ready {
                    drained.push(((*query, *stage), out));
                }
            }
            drained
        };

        let mut removed = 0;
        let mut collected = Vec::new();
        let mut failed = Vec::new();
        for ((query, stage), output) in deletable {
            match self
                .backend
                .delete_prefix(&attempt_dir(query, stage, output.attempt))
            {
                Ok(()) => {
                    info!(%query, %stage, attempt = output.attempt, "collected superseded exchange output");
                    global_metrics().inc_partitions_collected(
                        &query.to_string(),
                        output.index.partitions.len() as u64,
                    );
                    removed += 1;
                    collected.push(((query, stage), output));
                }
                Err(e) => {
                    warn!(
                        %query,
                        %stage,
                        attempt = output.attempt,
                        error = %e,
                        "exchange GC delete failed, retrying next sweep"
                    );
                    failed.push(((query, stage), output));
                }
            }
        }

        // An output counts as collected only once its files are gone; failed
        // deletions go back to the superseded list for the next sweep.
        let mut registry = self.registry.lock().expect("exchange registry lock");
        for ((query, stage), output) in collected {
            if let Some(entry) = registry.get_mut(&(query, stage)) {
                entry.collected_generations.insert(output.generation);
            }
        }
        for ((query, stage), output) in failed {
            if let Some(entry) = registry.get_mut(&(query, stage)) {
                entry.superseded.push(output);
            }
        }
        removed
    }

    /// Discards every sealed output of a query, regardless of refcounts.
    ///
    /// Used for whole-query restart: every stage's sinks reopen from
    /// scratch afterwards. In-flight readers observe
    /// [`FtqError::StaleExchange`] on their next open.
    pub fn invalidate_query(&self, query: QueryId) {
        let partitions: u64 = {
            let mut registry = self.registry.lock().expect("exchange registry lock");
            let stages: Vec<_> = registry
                .keys()
                .filter(|(q, _)| *q == query)
                .cloned()
                .collect();
            let mut count = 0;
            for key in stages {
                if let Some(entry) = registry.remove(&key) {
                    count += entry
                        .current
                        .iter()
                        .chain(entry.superseded.iter())
                        .map(|out| out.index.partitions.len() as u64)
                        .sum::<u64>();
                }
            }
            count
        };

        if let Err(e) = self.backend.delete_prefix(&query_dir(query)) {
            warn!(%query, error = %e, "exchange invalidation delete failed");
        }
        if partitions > 0 {
            global_metrics().inc_partitions_collected(&query.to_string(), partitions);
        }
        info!(%query, "invalidated exchange outputs for query restart");
    }

    /// Terminal cleanup when a query finishes or is cancelled.
    pub fn finish_query(&self, query: QueryId) {
        self.invalidate_query(query);
    }

    fn find_output_mut<'a>(
        registry: &'a mut HashMap<(QueryId, StageId), StageExchange>,
        handle: &ExchangeHandle,
    ) -> Result<&'a mut SealedOutput> {
        let stale = || FtqError::StaleExchange {
            query: handle.query,
            stage: handle.stage,
            attempt: handle.attempt,
        };
        let entry = registry
            .get_mut(&(handle.query, handle.stage))
            .ok_or_else(stale)?;
        if entry.collected_generations.contains(&handle.generation) {
            return Err(stale());
        }
        if entry
            .current
            .as_ref()
            .is_some_and(|out| out.generation == handle.generation)
        {
            return Ok(entry.current.as_mut().expect("current sealed output"));
        }
        entry
            .superseded
            .iter_mut()
            .find(|out| out.generation == handle.generation)
            .ok_or_else(stale)
    }
}

/// Write side of one producing attempt's spooled output.
///
/// Each partition is written exactly once; the whole attempt becomes
/// visible atomically on seal. Dropping an unsealed sink discards its
/// output.
pub struct ExchangeSink {
    query: QueryId,
    stage: StageId,
    attempt: u32,
    backend: Arc<dyn ExchangeBackend>,
    partitions: Vec<SpooledPartitionMeta>,
    written: HashSet<u32>,
    sealed: bool,
}

impl ExchangeSink {
    pub fn query(&self) -> QueryId {
        self.query
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Spools one partition's byte batches.
    ///
    /// # Errors
    /// Returns an error on IO failure or when the partition was already
    /// written within this attempt.
    pub fn write_partition(
        &mut self,
        partition: u32,
        batches: &[Vec<u8>],
    ) -> Result<SpooledPartitionMeta> {
        if !self.written.insert(partition) {
            return Err(FtqError::Execution(format!(
                "partition {partition} already spooled for attempt {} of stage {}",
                self.attempt, self.stage
            )));
        }

        let rel = partition_path(self.query, self.stage, self.attempt, partition);
        let encoded = encode_batches(batches);
        self.backend.put(&rel, &encoded)?;

        let meta = SpooledPartitionMeta {
            partition,
            file: rel,
            bytes: encoded.len() as u64,
            batches: batches.len() as u64,
        };
        debug!(
            query = %self.query,
            stage = %self.stage,
            attempt = self.attempt,
            partition,
            bytes = meta.bytes,
            "spooled exchange partition"
        );
        global_metrics().record_exchange_write(
            &self.query.to_string(),
            self.stage.0,
            meta.bytes,
            1,
        );
        self.partitions.push(meta.clone());
        Ok(meta)
    }

    /// Explicitly discards this attempt's partial output.
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.sealed {
            return;
        }
        self.sealed = true;
        let dir = attempt_dir(self.query, self.stage, self.attempt);
        if let Err(e) = self.backend.delete_prefix(&dir) {
            warn!(
                query = %self.query,
                stage = %self.stage,
                attempt = self.attempt,
                error = %e,
                "failed to discard unsealed exchange sink"
            );
        } else {
            debug!(
                query = %self.query,
                stage = %self.stage,
                attempt = self.attempt,
                "discarded unsealed exchange sink"
            );
        }
    }
}

impl Drop for ExchangeSink {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Lazy, finite, restartable sequence of byte batches for one partition.
#[derive(Debug)]
pub struct SpoolReader {
    data: Vec<u8>,
    offset: usize,
    remaining: u32,
    cancel: CancellationFlag,
}

impl SpoolReader {
    fn new(data: Vec<u8>, cancel: CancellationFlag) -> Result<Self> {
        if data.len() < SPOOL_HEADER_LEN {
            return Err(FtqError::Execution(
                "spooled partition is too small to contain header".to_string(),
            ));
        }
        if &data[0..4] != SPOOL_MAGIC {
            return Err(FtqError::DataCorruption {
                partition: "spooled partition".to_string(),
                message: "invalid spool magic".to_string(),
            });
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != SPOOL_VERSION {
            return Err(FtqError::Execution(format!(
                "unsupported spool version {version}"
            )));
        }
        let remaining = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        Ok(Self {
            data,
            offset: SPOOL_HEADER_LEN,
            remaining,
            cancel,
        })
    }

    /// Next byte batch, or `None` once the partition is exhausted.
    ///
    /// # Errors
    /// Returns [`FtqError::Cancelled`] promptly after query cancellation and
    /// [`FtqError::DataCorruption`] for malformed framing.
    pub fn next_batch(&mut self) -> Result<Option<Vec<u8>>> {
        self.cancel.check("exchange partition read")?;
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.offset + 4 > self.data.len() {
            return Err(FtqError::DataCorruption {
                partition: "spooled partition".to_string(),
                message: "truncated batch length".to_string(),
            });
        }
        let len = u32::from_le_bytes([
            self.data[self.offset],
            self.data[self.offset + 1],
            self.data[self.offset + 2],
            self.data[self.offset + 3],
        ]) as usize;
        self.offset += 4;
        if self.offset + len > self.data.len() {
            return Err(FtqError::DataCorruption {
                partition: "spooled partition".to_string(),
                message: "truncated batch payload".to_string(),
            });
        }
        let batch = self.data[self.offset..self.offset + len].to_vec();
        self.offset += len;
        self.remaining -= 1;
        Ok(Some(batch))
    }

    /// Drains the remaining batches.
    ///
    /// # Errors
    /// Same failure modes as [`Self::next_batch`].
    pub fn read_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch()? {
            out.push(batch);
        }
        Ok(out)
    }
}

fn encode_batches(batches: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = batches.iter().map(|b| 4 + b.len()).sum();
    let mut out = Vec::with_capacity(SPOOL_HEADER_LEN + payload_len);
    out.extend_from_slice(SPOOL_MAGIC);
    out.extend_from_slice(&SPOOL_VERSION.to_le_bytes());
    out.extend_from_slice(&(batches.len() as u32).to_le_bytes());
    for batch in batches {
        out.extend_from_slice(&(batch.len() as u32).to_le_bytes());
        out.extend_from_slice(batch);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use ftq_common::{
        AttemptId, CancellationFlag, ExchangeConfig, FtqError, QueryId, Result, StageId, TaskId,
    };

    use crate::backend::{ExchangeBackend, FsBackend};

    use super::ExchangeManager;

    /// Fails the next `delete_prefix` once, then delegates.
    struct FlakyDeleteBackend {
        inner: FsBackend,
        fail_next_delete: AtomicBool,
    }

    impl ExchangeBackend for FlakyDeleteBackend {
        fn put(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.put(path, data)
        }

        fn get(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.get(path)
        }

        fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path)
        }

        fn delete_prefix(&self, prefix: &str) -> Result<()> {
            if self.fail_next_delete.swap(false, Ordering::SeqCst) {
                return Err(FtqError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "delete refused",
                )));
            }
            self.inner.delete_prefix(prefix)
        }
    }

    /// Runs a GC sweep from inside the next `get`, emulating a reader that
    /// loses its file to a concurrent collection after the registry check.
    struct SweepOnReadBackend {
        inner: FsBackend,
        manager: Mutex<Option<Arc<ExchangeManager>>>,
        armed: AtomicBool,
    }

    impl ExchangeBackend for SweepOnReadBackend {
        fn put(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.put(path, data)
        }

        fn get(&self, path: &str) -> Result<Vec<u8>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                let manager = self.manager.lock().expect("manager slot").clone();
                if let Some(manager) = manager {
                    manager.collect_garbage();
                }
            }
            self.inner.get(path)
        }

        fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path)
        }

        fn delete_prefix(&self, prefix: &str) -> Result<()> {
            self.inner.delete_prefix(prefix)
        }
    }

    fn temp_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("ftq_exchange_test_{nanos}"))
    }

    fn manager(root: &PathBuf) -> ExchangeManager {
        let backend = FsBackend::new(&ExchangeConfig {
            base_directories: vec![root.clone()],
        })
        .expect("backend");
        ExchangeManager::new(Arc::new(backend))
    }

    fn consumer(stage: u64, task: u64, attempt: u32) -> AttemptId {
        AttemptId::new(TaskId::new(StageId(stage), task), attempt)
    }

    #[test]
    fn sealed_output_rereads_byte_identical() {
        let root = temp_root();
        let mgr = manager(&root);
        let (q, s) = (QueryId(1), StageId(1));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"alpha".to_vec(), b"beta".to_vec()])
            .expect("write p0");
        sink.write_partition(1, &[b"gamma".to_vec()]).expect("write p1");
        let handle = mgr.seal_sink(sink).expect("seal");

        assert_eq!(mgr.handle_partitions(&handle).expect("partitions"), vec![0, 1]);

        // First consumer reads partially, then a retried consumer restarts
        // from the beginning and sees identical content.
        let cancel = CancellationFlag::new();
        let mut first = mgr.open_source(&handle, 0, cancel.clone()).expect("open");
        assert_eq!(first.next_batch().expect("batch"), Some(b"alpha".to_vec()));

        let mut retried = mgr.open_source(&handle, 0, cancel.clone()).expect("reopen");
        assert_eq!(
            retried.read_all().expect("read all"),
            vec![b"alpha".to_vec(), b"beta".to_vec()]
        );
        let mut again = mgr.open_source(&handle, 0, cancel).expect("reopen again");
        assert_eq!(
            again.read_all().expect("read all"),
            vec![b"alpha".to_vec(), b"beta".to_vec()]
        );

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unsealed_sink_is_never_visible() {
        let root = temp_root();
        let mgr = manager(&root);
        let (q, s) = (QueryId(2), StageId(0));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"half-written".to_vec()])
            .expect("write");
        drop(sink);

        assert!(mgr.resolve(q, s).is_none());
        // The partial data is discarded from the backend as well.
        assert!(!root.join("exchange/2/0/1").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn aborted_sink_discards_output() {
        let root = temp_root();
        let mgr = manager(&root);
        let mut sink = mgr.open_sink(QueryId(3), StageId(0), 1);
        sink.write_partition(0, &[b"x".to_vec()]).expect("write");
        sink.abort();
        assert!(!root.join("exchange/3/0/1").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn double_partition_write_is_rejected() {
        let root = temp_root();
        let mgr = manager(&root);
        let mut sink = mgr.open_sink(QueryId(4), StageId(0), 1);
        sink.write_partition(0, &[b"once".to_vec()]).expect("write");
        let err = sink.write_partition(0, &[b"twice".to_vec()]).unwrap_err();
        assert!(matches!(err, FtqError::Execution(_)));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn gc_waits_for_consumer_refcount_then_collects() {
        let root = temp_root();
        let mgr = manager(&root);
        let (q, s) = (QueryId(5), StageId(1));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"v1".to_vec()]).expect("write");
        let old = mgr.seal_sink(sink).expect("seal attempt 1");

        let reader_attempt = consumer(2, 0, 1);
        mgr.add_consumer(&old, reader_attempt).expect("add consumer");

        // Producer is retried and seals a new attempt; the old one is
        // superseded but still referenced.
        let mut sink = mgr.open_sink(q, s, 2);
        sink.write_partition(0, &[b"v2".to_vec()]).expect("write");
        let new = mgr.seal_sink(sink).expect("seal attempt 2");
        assert_eq!(mgr.resolve(q, s), Some(new));

        assert_eq!(mgr.collect_garbage(), 0);
        // Old data is still readable while referenced.
        let cancel = CancellationFlag::new();
        let mut reader = mgr.open_source(&old, 0, cancel.clone()).expect("open old");
        assert_eq!(reader.read_all().expect("read"), vec![b"v1".to_vec()]);

        mgr.release(&old, reader_attempt);
        assert_eq!(mgr.collect_garbage(), 1);

        // Late reader against the collected handle fails with a stale error.
        let err = mgr.open_source(&old, 0, cancel.clone()).unwrap_err();
        assert!(matches!(err, FtqError::StaleExchange { .. }));
        // The superseding attempt stays readable.
        let mut reader = mgr.open_source(&new, 0, cancel).expect("open new");
        assert_eq!(reader.read_all().expect("read"), vec![b"v2".to_vec()]);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn invalidate_query_removes_all_outputs() {
        let root = temp_root();
        let mgr = manager(&root);
        let q = QueryId(6);

        let mut sink = mgr.open_sink(q, StageId(0), 1);
        sink.write_partition(0, &[b"a".to_vec()]).expect("write");
        let h0 = mgr.seal_sink(sink).expect("seal");
        let mut sink = mgr.open_sink(q, StageId(1), 1);
        sink.write_partition(0, &[b"b".to_vec()]).expect("write");
        mgr.seal_sink(sink).expect("seal");

        mgr.invalidate_query(q);
        assert!(mgr.resolve(q, StageId(0)).is_none());
        assert!(mgr.resolve(q, StageId(1)).is_none());
        let err = mgr
            .open_source(&h0, 0, CancellationFlag::new())
            .unwrap_err();
        assert!(matches!(err, FtqError::StaleExchange { .. }));
        assert!(!root.join("exchange/6").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn cancellation_aborts_reads_promptly() {
        let root = temp_root();
        let mgr = manager(&root);
        let (q, s) = (QueryId(7), StageId(0));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"one".to_vec(), b"two".to_vec()])
            .expect("write");
        let handle = mgr.seal_sink(sink).expect("seal");

        let cancel = CancellationFlag::new();
        let mut reader = mgr.open_source(&handle, 0, cancel.clone()).expect("open");
        assert_eq!(reader.next_batch().expect("batch"), Some(b"one".to_vec()));
        cancel.cancel();
        assert!(matches!(
            reader.next_batch().unwrap_err(),
            FtqError::Cancelled(_)
        ));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn gc_retries_failed_deletions_on_the_next_sweep() {
        let root = temp_root();
        let backend = Arc::new(FlakyDeleteBackend {
            inner: FsBackend::new(&ExchangeConfig {
                base_directories: vec![root.clone()],
            })
            .expect("backend"),
            fail_next_delete: AtomicBool::new(false),
        });
        let mgr = ExchangeManager::new(Arc::clone(&backend) as Arc<dyn ExchangeBackend>);
        let (q, s) = (QueryId(9), StageId(1));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"v1".to_vec()]).expect("write");
        let old = mgr.seal_sink(sink).expect("seal attempt 1");
        let mut sink = mgr.open_sink(q, s, 2);
        sink.write_partition(0, &[b"v2".to_vec()]).expect("write");
        mgr.seal_sink(sink).expect("seal attempt 2");

        // First sweep fails to delete; the output must stay tracked.
        backend.fail_next_delete.store(true, Ordering::SeqCst);
        assert_eq!(mgr.collect_garbage(), 0);
        assert!(root.join("exchange/9/1/1").exists());

        // Next sweep retries the same attempt and collects it.
        assert_eq!(mgr.collect_garbage(), 1);
        assert!(!root.join("exchange/9/1/1").exists());
        let err = mgr.open_source(&old, 0, CancellationFlag::new()).unwrap_err();
        assert!(matches!(err, FtqError::StaleExchange { .. }));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn read_losing_its_file_to_gc_reports_stale_not_fatal() {
        let root = temp_root();
        let backend = Arc::new(SweepOnReadBackend {
            inner: FsBackend::new(&ExchangeConfig {
                base_directories: vec![root.clone()],
            })
            .expect("backend"),
            manager: Mutex::new(None),
            armed: AtomicBool::new(false),
        });
        let mgr = Arc::new(ExchangeManager::new(
            Arc::clone(&backend) as Arc<dyn ExchangeBackend>
        ));
        *backend.manager.lock().expect("manager slot") = Some(Arc::clone(&mgr));
        let (q, s) = (QueryId(10), StageId(1));

        let mut sink = mgr.open_sink(q, s, 1);
        sink.write_partition(0, &[b"v1".to_vec()]).expect("write");
        let old = mgr.seal_sink(sink).expect("seal attempt 1");
        let mut sink = mgr.open_sink(q, s, 2);
        sink.write_partition(0, &[b"v2".to_vec()]).expect("write");
        mgr.seal_sink(sink).expect("seal attempt 2");

        // The unreferenced old output passes the registry check but is
        // collected before its file is read.
        backend.armed.store(true, Ordering::SeqCst);
        let err = mgr.open_source(&old, 0, CancellationFlag::new()).unwrap_err();
        assert!(matches!(err, FtqError::StaleExchange { .. }));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn empty_partition_round_trips() {
        let root = temp_root();
        let mgr = manager(&root);
        let mut sink = mgr.open_sink(QueryId(8), StageId(0), 1);
        sink.write_partition(0, &[]).expect("write empty");
        let handle = mgr.seal_sink(sink).expect("seal");
        let mut reader = mgr
            .open_source(&handle, 0, CancellationFlag::new())
            .expect("open");
        assert_eq!(reader.next_batch().expect("batch"), None);
        let _ = std::fs::remove_dir_all(root);
    }
}
