//! Retry policy with exponential backoff, plus randomized delay windows.
//!
//! The policy is an explicit value applied at each network call site, so it
//! can be inspected and tested apart from the calls it guards.
//!
//! # Backoff Strategy
//!
//! The delay between retries follows this formula:
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=jitter)
//! ```

use rand::{Rng, rng};
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, warn};

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries (doubles with each attempt).
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Deterministic part of the delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rng().random_range(0..=jitter_ms)
        };
        self.backoff_for(attempt) + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only errors for which `is_transient` returns `true` are retried.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let elapsed_ms_total = total_t0.elapsed().as_millis() as u64;

                    if !is_transient(&e) {
                        warn!(label, attempt, error = %e, "permanent failure; not retrying");
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        error!(
                            label,
                            attempt,
                            max = self.max_attempts,
                            elapsed_ms_total,
                            error = %e,
                            "exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        label,
                        attempt,
                        max = self.max_attempts,
                        elapsed_ms_total,
                        ?delay,
                        error = %e,
                        "attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Largest accepted window bound: one day.
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Inclusive window for randomized anti-detection delays, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DelayWindow {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayWindow {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Draw a delay uniformly from the window. Bounds are clamped to
    /// `0..=MAX_DELAY_SECS`; a non-finite window yields no delay.
    pub fn sample(&self) -> Duration {
        if !self.min_secs.is_finite() || !self.max_secs.is_finite() {
            return Duration::ZERO;
        }
        let lo = self.min_secs.clamp(0.0, MAX_DELAY_SECS);
        let hi = self.max_secs.clamp(lo, MAX_DELAY_SECS);
        if hi <= 0.0 {
            return Duration::ZERO;
        }
        let secs = if hi > lo { rng().random_range(lo..=hi) } else { lo };
        Duration::from_secs_f64(secs)
    }

    /// Finite, non-negative, ordered and no longer than [`MAX_DELAY_SECS`].
    pub fn is_valid(&self) -> bool {
        self.min_secs.is_finite()
            && self.max_secs.is_finite()
            && self.min_secs >= 0.0
            && self.max_secs >= self.min_secs
            && self.max_secs <= MAX_DELAY_SECS
    }
}
