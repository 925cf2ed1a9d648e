use thiserror::Error;

use crate::ids::{QueryId, StageId};

/// Canonical FTQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FtqError::WorkerLost`] / [`FtqError::StaleExchange`]: transient
///   infrastructure conditions the retry coordinator recovers from
/// - [`FtqError::ResourceExhausted`]: capacity pressure, retryable after
///   backoff (optionally onto different capacity)
/// - [`FtqError::ExternalSource`]: upstream connector/source failures that
///   may require a full re-read of the source
/// - [`FtqError::DataCorruption`]: never retried; names the partition
/// - [`FtqError::InvalidConfig`] / [`FtqError::Execution`] /
///   [`FtqError::Unsupported`]: non-retryable programming or contract errors
#[derive(Debug, Error)]
pub enum FtqError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - `retry.max-attempts` below 1
    /// - empty `exchange.base-directories`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime execution failures with no dedicated variant.
    ///
    /// Examples:
    /// - double write of a spooled partition within one attempt
    /// - exchange index decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker executing an attempt stopped responding or restarted.
    #[error("worker lost: {0}")]
    WorkerLost(String),

    /// Memory/disk/slot capacity was exhausted while executing an attempt.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An external table source or connector failed mid-read.
    #[error("external source error: {0}")]
    ExternalSource(String),

    /// Spooled or source data failed integrity checks. Never retried.
    #[error("data corruption in partition {partition}: {message}")]
    DataCorruption {
        /// Identifies the corrupted partition for diagnostics.
        partition: String,
        /// Underlying integrity failure description.
        message: String,
    },

    /// A reader resolved an exchange handle whose spooled output has
    /// already been superseded and garbage-collected.
    ///
    /// Not user-fatal: the retry coordinator converts this into a
    /// producer-side re-run.
    #[error("stale exchange output: query {query} stage {stage} attempt {attempt} was already collected")]
    StaleExchange {
        /// Owning query.
        query: QueryId,
        /// Producing stage whose output is gone.
        stage: StageId,
        /// Producing attempt the stale handle pointed at.
        attempt: u32,
    },

    /// The owning query was cancelled while the operation was in flight.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Valid request for behavior not implemented in the current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard FTQ result alias.
pub type Result<T> = std::result::Result<T, FtqError>;
