//! Scheduler error types.

use crate::ports::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("backing store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("failed to encode queue id or task: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode task popped from {queue}: {source}")]
    Decode {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SchedulerError {
    /// Store failures are transient; encoding problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::StoreUnavailable(_))
    }
}
