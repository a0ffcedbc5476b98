//! Retry policy for failed pipeline runs.

use serde::{Deserialize, Serialize};

use crate::Error;

/// What to do with a job whose pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Waiting` at the front of the queue.
    Requeue,
    /// Terminal failure.
    Fail,
}

/// Retry policy for a job's attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide based on the error class and retries consumed so far.
    ///
    /// A job is attempted at most `max_retries + 1` times. Fatal errors fail
    /// immediately regardless of the remaining budget.
    pub fn decide(&self, error: &Error, retry_count: u32, max_retries: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Fail;
        }
        if retry_count < max_retries {
            RetryDecision::Requeue
        } else {
            RetryDecision::Fail
        }
    }
}
