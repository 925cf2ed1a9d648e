//! Pure mapping from raw execution errors to retry categories.

use std::fmt;
use std::io;

use ftq_common::{FtqError, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Closed retry taxonomy driving the coordinator's decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Network blip, worker restart, stale spooled output. Retryable.
    TransientInfra,
    /// Memory/disk/slot pressure. Retryable, ideally onto other capacity.
    ResourceExhausted,
    /// External table source failed mid-read; only a whole-query restart
    /// can guarantee a consistent re-read.
    ExternalSource,
    /// Integrity failure in source or spooled data. Never retried.
    DataCorruption,
    /// Everything else. Never retried; unknown errors fail closed here.
    Fatal,
}

impl FailureCategory {
    /// Whether a failure of this category may be retried under `policy`.
    pub fn is_retryable(self, policy: RetryPolicy) -> bool {
        match self {
            FailureCategory::TransientInfra | FailureCategory::ResourceExhausted => {
                !matches!(policy, RetryPolicy::None)
            }
            FailureCategory::ExternalSource => matches!(policy, RetryPolicy::Query),
            FailureCategory::DataCorruption | FailureCategory::Fatal => false,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::TransientInfra => "transient infrastructure failure",
            FailureCategory::ResourceExhausted => "resource exhaustion",
            FailureCategory::ExternalSource => "external source failure",
            FailureCategory::DataCorruption => "data corruption",
            FailureCategory::Fatal => "fatal failure",
        };
        f.write_str(name)
    }
}

/// Classifies a raw error into its retry category.
///
/// Pure, total, and deterministic for the same error signature. Errors
/// without an explicit mapping are [`FailureCategory::Fatal`].
pub fn classify(error: &FtqError) -> FailureCategory {
    match error {
        FtqError::WorkerLost(_) | FtqError::StaleExchange { .. } => {
            FailureCategory::TransientInfra
        }
        FtqError::Io(e) => classify_io_kind(e.kind()),
        FtqError::ResourceExhausted(_) => FailureCategory::ResourceExhausted,
        FtqError::ExternalSource(_) => FailureCategory::ExternalSource,
        FtqError::DataCorruption { .. } => FailureCategory::DataCorruption,
        FtqError::InvalidConfig(_)
        | FtqError::Execution(_)
        | FtqError::Cancelled(_)
        | FtqError::Unsupported(_) => FailureCategory::Fatal,
    }
}

fn classify_io_kind(kind: io::ErrorKind) -> FailureCategory {
    match kind {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::UnexpectedEof => FailureCategory::TransientInfra,
        io::ErrorKind::OutOfMemory => FailureCategory::ResourceExhausted,
        _ => FailureCategory::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use ftq_common::{FtqError, QueryId, RetryPolicy, StageId};

    use super::{classify, FailureCategory};

    #[test]
    fn maps_variants_to_categories() {
        assert_eq!(
            classify(&FtqError::WorkerLost("w1 heartbeat lost".into())),
            FailureCategory::TransientInfra
        );
        assert_eq!(
            classify(&FtqError::StaleExchange {
                query: QueryId(1),
                stage: StageId(0),
                attempt: 1,
            }),
            FailureCategory::TransientInfra
        );
        assert_eq!(
            classify(&FtqError::ResourceExhausted("out of spill space".into())),
            FailureCategory::ResourceExhausted
        );
        assert_eq!(
            classify(&FtqError::ExternalSource("connector reset".into())),
            FailureCategory::ExternalSource
        );
        assert_eq!(
            classify(&FtqError::DataCorruption {
                partition: "exchange/1/0/1/part-0.bin".into(),
                message: "bad checksum".into(),
            }),
            FailureCategory::DataCorruption
        );
        assert_eq!(
            classify(&FtqError::Execution("shape mismatch".into())),
            FailureCategory::Fatal
        );
    }

    #[test]
    fn io_kinds_split_between_transient_and_fatal() {
        let transient = FtqError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&transient), FailureCategory::TransientInfra);
        let oom = FtqError::Io(io::Error::new(io::ErrorKind::OutOfMemory, "oom"));
        assert_eq!(classify(&oom), FailureCategory::ResourceExhausted);
        let unknown = FtqError::Io(io::Error::other("unmapped"));
        assert_eq!(classify(&unknown), FailureCategory::Fatal);
    }

    #[test]
    fn classification_is_deterministic() {
        let err = FtqError::WorkerLost("w2".into());
        assert_eq!(classify(&err), classify(&err));
    }

    #[test]
    fn retryability_decision_table() {
        use FailureCategory::*;
        use RetryPolicy::*;

        assert!(TransientInfra.is_retryable(Task));
        assert!(TransientInfra.is_retryable(Query));
        assert!(!TransientInfra.is_retryable(None));

        assert!(ResourceExhausted.is_retryable(Task));
        assert!(ResourceExhausted.is_retryable(Query));
        assert!(!ResourceExhausted.is_retryable(None));

        // External sources may need a full re-read: query granularity only.
        assert!(!ExternalSource.is_retryable(Task));
        assert!(ExternalSource.is_retryable(Query));
        assert!(!ExternalSource.is_retryable(None));

        for policy in [None, Task, Query] {
            assert!(!DataCorruption.is_retryable(policy));
            assert!(!Fatal.is_retryable(policy));
        }
    }
}
