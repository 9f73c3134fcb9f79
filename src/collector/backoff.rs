//! Retry delay policy for a single fetch.
//!
//! Exponential backoff `base * 2^(attempt-1)` capped at `max_delay`, with
//! symmetric jitter. Rate-limit responses carrying a server retry-after use
//! that value instead, bounded by `max_retry_after`. Fatal errors are never
//! retried.

use std::time::Duration;

use rand::Rng;

use crate::collector::ErrorKind;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound of the exponential delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default jitter ratio (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Default ceiling for a server-supplied retry-after (15 minutes).
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(15 * 60);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    RetryAfter(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Exponential backoff with cap and jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    jitter: f64,
    max_retry_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES)
    }
}

impl BackoffPolicy {
    /// Create a policy with the default jitter.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: DEFAULT_JITTER,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }

    /// Set the longest server retry-after honoured as-is; longer hints are
    /// shortened to this.
    pub fn with_max_retry_after(mut self, ceiling: Duration) -> Self {
        self.max_retry_after = ceiling;
        self
    }

    /// Set the jitter ratio, clamped to `[0, 1)`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = if ratio.is_finite() {
            ratio.clamp(0.0, 0.99)
        } else {
            0.0
        };
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }

    /// Un-jittered delay after `attempt` failed attempts (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide whether and when to retry after `attempt` failed attempts.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.next_delay_with(attempt, kind, sample)
    }

    /// Same as [`next_delay`](Self::next_delay) with an explicit jitter
    /// sample in `[-1, 1]` (`0` means no jitter).
    pub fn next_delay_with(&self, attempt: u32, kind: ErrorKind, sample: f64) -> RetryDecision {
        match kind {
            ErrorKind::Fatal => RetryDecision::GiveUp,
            _ if attempt > self.max_retries => RetryDecision::GiveUp,
            ErrorKind::RateLimited {
                retry_after: Some(wait),
            } => RetryDecision::RetryAfter(wait.min(self.max_retry_after)),
            ErrorKind::RateLimited { retry_after: None } | ErrorKind::Transient => {
                let nominal = self.nominal_delay(attempt);
                let factor = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
                let jittered = Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
                    .unwrap_or(nominal);
                RetryDecision::RetryAfter(jittered)
            }
        }
    }
}
