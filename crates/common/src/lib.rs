//! Shared configuration, error types, IDs, and observability primitives for FTQ crates.
//!
//! Architecture role:
//! - defines retry/exchange configuration passed across layers
//! - provides common [`FtqError`] / [`Result`] contracts
//! - hosts typed identifiers for queries, stages, tasks, attempts, and plan nodes
//! - hosts the prometheus metrics registry shared by the execution core
//!
//! Key modules:
//! - [`cancel`]
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use cancel::CancellationFlag;
pub use config::{ExchangeConfig, RetryConfig, RetryPolicy};
pub use error::{FtqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
