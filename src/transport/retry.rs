//! Retry policy
//!
//! Exponential backoff with symmetric jitter:
//!
//! ```text
//! delay(n) = min(max_delay, base_delay * multiplier^(n-1)) * uniform(1 - jitter, 1 + jitter)
//! ```
//!
//! where `n` is the number of the attempt that just failed. A `Retry-After`
//! hint from the server raises the delay (never above `max_delay`).

use super::{FailureKind, TransportError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry configuration shared by part attempts and control-plane calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    /// Fraction of the delay used as the jitter band (0.2 = +/-20%)
    jitter: f64,
    retryable: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(20),
            jitter: 0.2,
            retryable: vec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Throttled,
                FailureKind::ServerError,
            ],
        }
    }
}

impl RetryPolicy {
    /// Default policy with `max_attempts` total attempts (at least one)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Replace the set of failure kinds that are retried
    pub fn with_retryable(mut self, kinds: Vec<FailureKind>) -> Self {
        self.retryable = kinds;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retryable_kinds(&self) -> &[FailureKind] {
        &self.retryable
    }

    pub fn is_retryable(&self, err: &TransportError) -> bool {
        self.retryable.contains(&err.kind())
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    pub fn should_retry(&self, err: &TransportError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.is_retryable(err)
    }

    /// Backoff after failed attempt `attempt` (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped.max(0.0).round() as u64)
    }

    /// Backoff after failed attempt `attempt`, jittered and raised to `retry_after`
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jittered = if self.jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            Duration::from_nanos((base.as_nanos() as f64 * factor).round() as u64)
        } else {
            base
        };
        match retry_after {
            Some(hint) => jittered.max(hint.min(self.max_delay)),
            None => jittered,
        }
    }

    /// Run `operation` until it succeeds, fails fatally or attempts run out
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.backoff(attempt, err.retry_after());
                    tracing::warn!(
                        operation = name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
