//! Failure classification and retry coordination for task attempts.
//!
//! Architecture role:
//! - maps raw execution errors onto a closed retry taxonomy;
//! - owns the per-task attempt state machine (scheduled, running,
//!   succeeded, abandoned) with attempt budgets and exponential backoff;
//! - decides retry granularity per the query's [`ftq_common::RetryPolicy`],
//!   reusing spooled exchange output where possible and escalating to a
//!   whole-query restart where not;
//! - routes terminal-success statistics into the stats aggregator.
//!
//! Key modules:
//! - [`classifier`]
//! - [`coordinator`]

pub mod classifier;
pub mod coordinator;

pub use classifier::{classify, FailureCategory};
pub use coordinator::{
    AttemptOutcome, RetryCoordinator, RetryDecision, TaskFailure, TaskState,
};
