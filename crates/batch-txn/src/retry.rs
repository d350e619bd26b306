//! Retry policy for transaction attempts.

use std::{thread, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::errors::{PermanentFailure, TxnError};

/// Runs a transaction attempt, re-running it on transient failures.
pub trait RetryHelper {
    /// Runs `body` until it succeeds, fails with anything other than
    /// [`TxnError::Retryable`], or the policy gives up.  Giving up turns the
    /// last retryable error into [`TxnError::Permanent`].
    fn run<T, F>(&self, body: F) -> Result<T, TxnError>
    where
        F: FnMut() -> Result<T, TxnError>;
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Multiplier for each subsequent retry (exponential backoff).
    pub multiplier: f64,

    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Retries immediately, up to `max_retries` times.
    pub fn no_delay(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Calculate the delay before the given retry.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Check if another retry is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// [`RetryHelper`] sleeping the calling thread with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct BackoffRetryHelper {
    config: RetryConfig,
}

impl BackoffRetryHelper {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryHelper for BackoffRetryHelper {
    fn run<T, F>(&self, mut body: F) -> Result<T, TxnError>
    where
        F: FnMut() -> Result<T, TxnError>,
    {
        let mut retries = 0;
        loop {
            let e = match body() {
                Err(TxnError::Retryable(e)) => e,
                res => return res,
            };

            if !self.config.should_retry(retries) {
                error!(err = %e, %retries, "transaction kept failing, giving up");
                let e = e.context(format!("gave up after {retries} retries"));
                return Err(TxnError::Permanent(PermanentFailure::new(e)));
            }

            let delay = self.config.calculate_delay(retries);
            warn!(err = %e, %retries, ?delay, "transaction attempt failed, retrying");
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            retries += 1;
        }
    }
}
