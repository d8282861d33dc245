//! Bounded retry with exponential backoff.
//!
//! Before the nth retry (n starting at 1) the policy sleeps
//! `clamp(2^n, min_delay, max_delay)` units. With the defaults that is
//! 5, 5, 8, 16, 32, 60, 60, ... seconds, for at most 10 attempts in total.

use std::time::Duration;
use tracing::warn;

/// Retry budget and backoff shape for one network call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Lower bound on the backoff, in units.
    pub min_delay: u64,
    /// Upper bound on the backoff, in units.
    pub max_delay: u64,
    /// Length of one backoff unit.
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay: 5,
            max_delay: 60,
            unit: Duration::from_secs(1),
        }
    }
}

/// Every attempt failed. Carries the last error observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// Same schedule, scaled to a different unit (tests use milliseconds or zero).
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before the given retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = 2u64.checked_pow(retry).unwrap_or(u64::MAX);
        let units = exp.clamp(self.min_delay, self.max_delay.max(self.min_delay));
        self.unit.saturating_mul(units.min(u32::MAX as u64) as u32)
    }

    /// Run `op` until it succeeds or the budget is spent, sleeping between attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        self.run_with_sleep(op, std::thread::sleep)
    }

    /// Like [`run`](Self::run) with an injectable sleep.
    pub fn run_with_sleep<T, E, F, S>(&self, mut op: F, mut sleep: S) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= max_attempts => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last,
                    })
                }
                Err(e) => {
                    let delay = self.delay_for_retry(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
