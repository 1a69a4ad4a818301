//! Bulk execution of a body over many elements through one breaker
//!
//! Every element runs inside its own retry loop, and all loops share the
//! same [`CircuitBreaker`], so a dependency that starts failing for some
//! elements opens the circuit for the rest.
//!
//! ```text
//!   items ──► for_each ─────────────► retry ──► breaker ──► body   (in order)
//!
//!   items ──► parallel_for_each ──┬─► retry ──► breaker ──► body
//!              (semaphore-bound)  ├─► retry ──► breaker ──► body
//!                                 └─► retry ──► breaker ──► body
//! ```

use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{BulkError, RetryError};
use crate::retry::RetryOptions;

/// Run `body` for each element in order, each through a retry loop
///
/// Stops at the first element whose retries are exhausted and returns that
/// element's error; later elements are never started. On success the values
/// are returned in input order.
#[instrument(skip_all, fields(breaker = %breaker.name()))]
pub fn for_each<I, T, E, F>(
    breaker: &CircuitBreaker,
    items: impl IntoIterator<Item = I>,
    mut body: F,
    options: &RetryOptions,
) -> Result<Vec<T>, RetryError<E>>
where
    F: FnMut(&I) -> Result<T, E>,
{
    items
        .into_iter()
        .map(|item| breaker.execute_with_retries(|| body(&item), options))
        .collect()
}

/// Async form of [`for_each`]; elements still run one at a time
#[instrument(skip_all, fields(breaker = %breaker.name()))]
pub async fn for_each_async<I, T, E, F, Fut>(
    breaker: &CircuitBreaker,
    items: impl IntoIterator<Item = I>,
    mut body: F,
    options: &RetryOptions,
) -> Result<Vec<T>, RetryError<E>>
where
    F: FnMut(&I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut results = Vec::new();
    for item in items {
        let value = breaker
            .execute_with_retries_async(|| body(&item), options)
            .await?;
        results.push(value);
    }
    Ok(results)
}

/// Run `body` for the elements concurrently, at most `max_concurrency` at a time
///
/// Each element gets its own retry loop on a tokio task. Once any element
/// fails, no further elements are dispatched; elements already running are
/// allowed to finish and their failures are collected too.
///
/// A `max_concurrency` of zero is treated as one.
///
/// # Errors
///
/// Returns [`BulkError`] listing every failed element by index, in index
/// order. If `body` panics, the panic is resumed on the caller.
#[instrument(skip_all, fields(breaker = %breaker.name(), max_concurrency = max_concurrency))]
pub async fn parallel_for_each<I, T, E, F, Fut>(
    breaker: &CircuitBreaker,
    items: impl IntoIterator<Item = I>,
    body: F,
    options: &RetryOptions,
    max_concurrency: usize,
) -> Result<Vec<T>, BulkError<E>>
where
    I: Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(&I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let body = Arc::new(body);
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut workers = JoinSet::new();
    let mut dispatched = 0usize;

    for (index, item) in items.into_iter().enumerate() {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        if failed.load(Ordering::Acquire) {
            debug!(dispatched, "Element failed, stopping dispatch");
            break;
        }

        let breaker = breaker.clone();
        let body = Arc::clone(&body);
        let failed = Arc::clone(&failed);
        let options = options.clone();

        workers.spawn(async move {
            let result = breaker
                .execute_with_retries_async(|| body(&item), &options)
                .await;
            if result.is_err() {
                failed.store(true, Ordering::Release);
            }
            drop(permit);
            (index, result)
        });
        dispatched += 1;
    }

    let mut values: Vec<Option<T>> = std::iter::repeat_with(|| None).take(dispatched).collect();
    let mut failures = Vec::new();

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, Ok(value))) => values[index] = Some(value),
            Ok((index, Err(err))) => failures.push((index, err)),
            Err(join_error) => match join_error.try_into_panic() {
                Ok(payload) => panic::resume_unwind(payload),
                Err(join_error) => error!(error = %join_error, "Bulk worker cancelled"),
            },
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        warn!(failed = failures.len(), dispatched, "Parallel run failed");
        return Err(BulkError { failures });
    }

    debug!(completed = dispatched, "Parallel run completed");
    Ok(values.into_iter().flatten().collect())
}
