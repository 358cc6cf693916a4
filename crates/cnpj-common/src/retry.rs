//! Bounded retry policy
//!
//! A `RetryPolicy` runs an async operation up to `max_attempts` times, sleeping
//! between attempts. The operation itself knows nothing about retrying, so the
//! same policy wraps HTTP requests and whole-batch database loads alike.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Delay strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),
    /// `base * 2^(attempt - 1)` before retry number `attempt`
    Exponential(Duration),
}

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (always at least 1)
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Retry with a fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Retry with exponential backoff starting at `base`
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential(base),
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor)
            },
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted
    ///
    /// Returns the last error when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    info!(operation, delay_secs = delay.as_secs_f64(), "Retrying after delay");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    if self.max_attempts > 1 {
                        warn!(
                            operation,
                            attempts = self.max_attempts,
                            error = %e,
                            "All attempts failed"
                        );
                    }
                    return Err(e);
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, ten seconds apart
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(10))
    }
}
