use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::config::RetryConfig;

/// Classifies an error as worth retrying.
///
/// Only transient failures (network, timeouts, 408/429/5xx) go back through the
/// policy; everything else propagates on the first occurrence.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff with jitter: the wait before retry `n` is
/// `min(max_wait, base_wait * 2^n)` scaled by a random factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_wait: Duration,
    max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_wait: Duration, max_wait: Duration) -> Self {
        debug_assert!(max_attempts > 0, "at least one attempt is required");
        Self {
            max_attempts: max_attempts.max(1),
            base_wait,
            max_wait: max_wait.max(base_wait),
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            cfg.max_api_tries,
            seconds(cfg.retry_exp_wait_multiplier),
            seconds(cfg.retry_wait_max),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_wait)
            .with_max_delay(self.max_wait)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }

    /// Invoke `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` invocations have failed. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        op.retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|err: &E| err.is_transient())
            .notify(|err: &E, delay: Duration| {
                warn!(
                    operation,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; retrying"
                );
            })
            .await
    }
}

/// Negative, NaN, and out-of-range values collapse to zero instead of panicking.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
