//! Bounded retry for transient ledger failures.
//!
//! Only errors for which [`LedgerError::is_transient`] holds are retried.
//! Everything else (insufficient balance, unknown account, ...) returns on
//! the first attempt.

use crate::{
    config::RetryConfig,
    error::{LedgerError, LedgerResult},
};
use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// Exponential backoff policy for synchronous store operations. No jitter,
/// so seeded runs replay the same delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Retries without sleeping between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, 0, 0)
    }

    /// Delays between attempts; one fewer than `max_attempts`.
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_attempts - 1)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the zero-based attempt number.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> LedgerResult<T>
    where
        F: FnMut(usize) -> LedgerResult<T>,
    {
        let mut delays = self.backoff().build();
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    let Some(delay) = delays.next() else {
                        log::warn!("{operation}: giving up after {attempt} attempts: {err}");
                        return Err(err);
                    };
                    log::debug!("{operation}: transient failure on attempt {attempt}, retrying in {delay:?}: {err}");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay_ms, config.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Shorthand for the optimistic-conflict error.
pub(crate) fn conflict(entity: &'static str, id: impl ToString) -> LedgerError {
    LedgerError::ConcurrencyConflict {
        entity,
        id: id.to_string(),
    }
}
