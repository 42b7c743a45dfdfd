//! Bounded retry with backoff and per-attempt timeouts for tier calls

use crate::error::{Result, SpatialError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    /// Ceiling for a single attempt; an attempt that takes longer counts as
    /// `StoreUnavailable`.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 120,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. Exhaustion is reported as `StoreUnavailable`.
    pub async fn run<T, F, Fut>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(self.attempt_timeout(), op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SpatialError::unavailable(
                    context,
                    format!("timed out after {} ms", self.attempt_timeout_ms),
                )),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt < attempts {
                        warn!(context, attempt, error = %err, "transient failure, retrying");
                        tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(SpatialError::unavailable(
            context,
            format!("gave up after {} attempts: {}", attempts, reason),
        ))
    }
}
