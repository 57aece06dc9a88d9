//! Bounded retry with a fixed delay between attempts
//!
//! Shared by stateful connection acquisition and cron delivery.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: up to `max_attempts` tries, `delay_ms` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "RetryPolicy::default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            delay_ms: Self::default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_delay_ms() -> u64 {
        500
    }

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// A single attempt, no retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// when every attempt fails. A policy with `max_attempts == 0` still
    /// makes one attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(attempt, max_attempts = attempts, error = %e, "Attempt failed, retrying");
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
