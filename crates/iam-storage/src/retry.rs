//! Bounded retry for storage mutations that hit lock-ordering conflicts.
//!
//! Concurrent batches touching overlapping memberships refresh the same rows of
//! the derived index, and the database may abort one of them with a deadlock.
//! [`DeadlockRetry`] re-runs such a mutation a fixed number of times with a fixed
//! pause in between. Every other outcome ends the loop immediately.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{MutationError, StorageError};

/// Default number of attempts, including the first one.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default pause between two attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Retry policy applied uniformly to every membership mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlockRetry {
    attempts: u32,
    interval: Duration,
}

impl Default for DeadlockRetry {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

impl DeadlockRetry {
    /// Creates a policy making at most `attempts` attempts (at least one) with
    /// `interval` between them.
    #[must_use]
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `mutation` until it succeeds, fails with a non-deadlock error, or the
    /// attempt budget is spent.
    ///
    /// The pause is not cancellable and carries no backoff or jitter.
    ///
    /// # Errors
    ///
    /// Returns the last storage error wrapped in a [`MutationError`] together
    /// with `operation` and the JSON rendering of `args`.
    pub async fn run<T, A, F, Fut>(
        &self,
        operation: &str,
        args: &A,
        mut mutation: F,
    ) -> Result<T, MutationError>
    where
        A: Serialize + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match mutation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "mutation succeeded after deadlock retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_deadlock() && attempt < self.attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        retry_in_ms = self.interval.as_millis() as u64,
                        error = %err,
                        "deadlock detected, retrying"
                    );
                    tokio::time::sleep(self.interval).await;
                }
                Err(err) => {
                    debug!(operation, attempt, category = %err.category(), "mutation failed");
                    return Err(MutationError {
                        operation: operation.to_string(),
                        args: render_args(args),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

fn render_args<A: Serialize + ?Sized>(args: &A) -> String {
    serde_json::to_string(args).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}
