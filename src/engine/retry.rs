// src/engine/retry.rs

//! Failure classification and backoff for node retries.

use std::time::Duration;

use crate::exec::ExecutionError;

/// Retry settings shared by every node of every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub budget: u32,
    /// Delay before the first retry; doubles on each following retry.
    pub base_backoff: Duration,
    /// Lowercase substrings that mark an error message as transient.
    pub transient_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 2,
            base_backoff: Duration::from_millis(500),
            transient_markers: ["timeout", "tempor", "connection", "rate limit", "429"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Timeouts are always transient and cancellation never is. Anything else
    /// is matched case-insensitively against the transient markers.
    pub fn is_retryable(&self, error: &ExecutionError) -> bool {
        match error {
            ExecutionError::Timeout(_) => true,
            ExecutionError::Cancelled => false,
            ExecutionError::Failed(msg) => {
                let msg = msg.to_lowercase();
                self.transient_markers
                    .iter()
                    .any(|marker| msg.contains(marker.as_str()))
            }
        }
    }

    /// Sleep before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_backoff.saturating_mul(1u32 << shift)
    }

    /// Whether `failures` failed attempts still leave room for another one.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.budget
    }
}
