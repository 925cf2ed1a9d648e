//! Durable exchange spooling for fault-tolerant execution.
//!
//! Producing attempts write partitioned byte batches once; consuming
//! attempts (including retried ones) re-read them any number of times.
//! Output becomes visible atomically when a sink is sealed, superseding any
//! prior attempt's output for the same stage; superseded output is
//! garbage-collected once no in-flight consumer still references it.
//!
//! Key modules:
//! - [`layout`]: spool addressing and the sealed-output index
//! - [`backend`]: pluggable storage contract plus the filesystem backend
//! - [`manager`]: sinks, sources, handle resolution, and GC
//!
//! Feature flags:
//! - `object-store`: adds an `object_store`-crate backed backend.

pub mod backend;
pub mod layout;
pub mod manager;
#[cfg(feature = "object-store")]
pub mod object_store_backend;

pub use backend::{ExchangeBackend, FsBackend};
pub use layout::{SpooledPartitionMeta, StageOutputIndex};
pub use manager::{ExchangeHandle, ExchangeManager, ExchangeSink, SpoolReader};
#[cfg(feature = "object-store")]
pub use object_store_backend::ObjectStoreBackend;
