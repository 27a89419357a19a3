//! Retry policy shared by every network call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows attempt `attempt_index` (0-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter.min(1.0));
        let extra = rand::thread_rng().gen_range(0.0..=1.0);
        delay + spread.mul_f64(extra)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The closure receives the 0-based
    /// attempt index.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let last = attempt + 1 >= attempts;
                    if last || err.disposition() == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
