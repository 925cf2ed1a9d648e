//! Query-scoped cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FtqError, Result};

/// Shared cancellation flag owned by a query's execution context.
///
/// Exchange readers check it between batches and backoff scheduling checks
/// it before handing out runnable attempts, so cancellation takes effect
/// promptly without aborting threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the owning query as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a [`FtqError::Cancelled`] error if the flag is set.
    ///
    /// # Errors
    /// Fails when the owning query has been cancelled.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(FtqError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CancellationFlag;

    #[test]
    fn clones_share_state() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
        assert!(other.check("read").is_err());
    }
}
