//! Fixed-interval retry through a circuit breaker

use std::future::Future;
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{CircuitBreakerError, RetryError};

/// Retry budget and delay for one guarded call
///
/// Every attempt counts against `allowed_retries`, including attempts the
/// breaker refused without running the operation. The delay between
/// attempts is always `retry_interval`; there is no backoff or jitter.
///
/// # Example
///
/// ```
/// use reliable::RetryOptions;
/// use std::time::Duration;
///
/// let options = RetryOptions::new()
///     .with_allowed_retries(3)
///     .with_retry_interval(Duration::from_millis(250));
///
/// assert!(options.has_attempts_remaining(2));
/// assert!(!options.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum number of attempts
    pub allowed_retries: u16,

    /// Delay after each failed or refused attempt
    #[serde(with = "crate::serde_millis")]
    pub retry_interval: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            allowed_retries: 12,
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl RetryOptions {
    /// Create retry options with the defaults (12 attempts, 5 seconds apart)
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry back to back with no delay
    pub fn no_delay(allowed_retries: u16) -> Self {
        Self {
            allowed_retries,
            retry_interval: Duration::ZERO,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_allowed_retries(mut self, allowed_retries: u16) -> Self {
        self.allowed_retries = allowed_retries;
        self
    }

    /// Set the delay between attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Check if there are remaining attempts after `attempts` were made
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < u32::from(self.allowed_retries)
    }
}

/// Attempt bookkeeping shared by the sync and async loops
struct Attempts<'a, E> {
    options: &'a RetryOptions,
    made: u32,
    failures: Vec<E>,
}

impl<'a, E> Attempts<'a, E> {
    fn new(options: &'a RetryOptions) -> Self {
        Self {
            options,
            made: 0,
            failures: Vec::new(),
        }
    }

    fn remaining(&self) -> bool {
        self.options.has_attempts_remaining(self.made)
    }

    /// Count one unsuccessful attempt; `None` means the breaker refused it
    ///
    /// Breaks with the terminal error once the budget is spent.
    fn record(&mut self, failure: Option<E>) -> ControlFlow<RetryError<E>> {
        self.made += 1;
        let refused = failure.is_none();
        if let Some(cause) = failure {
            self.failures.push(cause);
        }

        if !self.remaining() {
            return ControlFlow::Break(self.exhausted());
        }

        debug!(
            attempt = self.made,
            refused,
            interval = ?self.options.retry_interval,
            "Attempt unsuccessful, retrying"
        );
        ControlFlow::Continue(())
    }

    fn exhausted(&mut self) -> RetryError<E> {
        let attempts = self.made;
        let error = if self.failures.is_empty() {
            RetryError::Open { attempts }
        } else {
            RetryError::Aggregate {
                attempts,
                failures: std::mem::take(&mut self.failures),
            }
        };
        warn!(attempts, failures = error.failures().len(), "Retries exhausted");
        error
    }
}

/// Failure to record for one `execute` outcome, or the value on success
fn classify<T, E>(outcome: Result<T, CircuitBreakerError<E>>) -> Result<T, Option<E>> {
    match outcome {
        Ok(value) => Ok(value),
        // Opened between the admission check and the call
        Err(CircuitBreakerError::Open) => Err(None),
        Err(CircuitBreakerError::OperationFailed(cause)) => Err(Some(cause)),
    }
}

impl CircuitBreaker {
    /// Run `operation` through the breaker, retrying up to
    /// `options.allowed_retries` times
    ///
    /// Attempts refused by an open circuit do not invoke the operation but
    /// still count. Sleeps the calling thread between attempts.
    ///
    /// Returns [`RetryError::Aggregate`] with every recorded operation error
    /// if at least one attempt ran, or [`RetryError::Open`] if none did.
    #[instrument(skip_all, fields(breaker = %self.name(), allowed_retries = options.allowed_retries))]
    pub fn execute_with_retries<T, E, F>(
        &self,
        mut operation: F,
        options: &RetryOptions,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut attempts = Attempts::new(options);

        while attempts.remaining() {
            let failure = if self.allowed_to_attempt_execute() {
                match classify(self.execute(&mut operation)) {
                    Ok(value) => return Ok(value),
                    Err(failure) => failure,
                }
            } else {
                None
            };

            if let ControlFlow::Break(error) = attempts.record(failure) {
                return Err(error);
            }
            thread::sleep(options.retry_interval);
        }

        Err(attempts.exhausted())
    }

    /// Like [`execute_with_retries`](Self::execute_with_retries), discarding the value
    pub fn run_with_retries<T, E, F>(
        &self,
        operation: F,
        options: &RetryOptions,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        self.execute_with_retries(operation, options).map(|_| ())
    }

    /// Async form of [`execute_with_retries`](Self::execute_with_retries)
    ///
    /// Suspends on `tokio::time::sleep` between attempts.
    #[instrument(skip_all, fields(breaker = %self.name(), allowed_retries = options.allowed_retries))]
    pub async fn execute_with_retries_async<T, E, F, Fut>(
        &self,
        mut operation: F,
        options: &RetryOptions,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = Attempts::new(options);

        while attempts.remaining() {
            let failure = if self.allowed_to_attempt_execute() {
                match classify(self.execute_async(&mut operation).await) {
                    Ok(value) => return Ok(value),
                    Err(failure) => failure,
                }
            } else {
                None
            };

            if let ControlFlow::Break(error) = attempts.record(failure) {
                return Err(error);
            }
            tokio::time::sleep(options.retry_interval).await;
        }

        Err(attempts.exhausted())
    }
}
