use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FtqError, Result};

/// Retry granularity, fixed per query at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Retries are disabled; the first failure is terminal.
    None,
    /// Only the failing task is retried, reusing spooled sibling output.
    Task,
    /// Any retryable failure discards all progress and restarts the query.
    Query,
}

/// Retry coordinator behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry granularity for the query.
    pub policy: RetryPolicy,
    /// Max attempts before a logical task is considered terminally failed.
    pub max_attempts: u32,
    /// Backoff delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on the exponential backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Task,
            max_attempts: 3,
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Validates field ranges.
    ///
    /// # Errors
    /// Fails when `max_attempts` is zero or the backoff bounds are inverted.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(FtqError::InvalidConfig(
                "retry.max-attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(FtqError::InvalidConfig(
                "retry.max-delay must be >= retry.initial-delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exchange spooling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Root paths for spooled data, used round-robin for load spreading.
    pub base_directories: Vec<PathBuf>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_directories: vec![PathBuf::from(".ftq_exchange")],
        }
    }
}

impl ExchangeConfig {
    /// Validates field ranges.
    ///
    /// # Errors
    /// Fails when no base directory is configured.
    pub fn validate(&self) -> Result<()> {
        if self.base_directories.is_empty() {
            return Err(FtqError::InvalidConfig(
                "exchange.base-directories must name at least one path".to_string(),
            ));
        }
        Ok(())
    }
}
