//! Bounded retry with exponential backoff for network calls.
//!
//! Every object-store and fast-store request goes through a [`RetryPolicy`].
//! Transport errors and 5xx responses are retried with `base_delay * 2^n`
//! pauses; format errors, preconditions, and missing objects are not.

use crate::{Error, Result};

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum attempts and backoff base for retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub max_retries: u32,
    /// First backoff pause; doubles each attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails non-retriably, or all
    /// attempts are used up (surfaced as [`Error::TooManyRetries`]).
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 0..self.max_retries {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() => {
                    let backoff = self.base_delay * 2_u32.pow(attempt);
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        error = %e,
                        "retrying after {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::TooManyRetries)
    }
}
