//! Circuit breaker state machine
//!
//! This module provides:
//! - [`CircuitBreaker`] - Admission gate for calls to one dependency
//! - [`StateTransition`] / [`ServiceLevelChange`] - Notification payloads
//! - [`SubscriptionId`] - Handle for removing a notification callback
//!
//! # Concurrency
//!
//! All state lives in atomics. The Open check at the start of
//! [`CircuitBreaker::execute`] and the failure-count update after the
//! operation are separate steps: a burst of callers can all be admitted
//! before any of their outcomes is recorded. The threshold is therefore a
//! soft bound on in-flight attempts, not a hard cap. The gap must not be
//! closed with a lock around `execute`: guarded calls to one dependency
//! have to run in parallel.

mod events;
mod timer;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, ConfigError};
use crate::error::CircuitBreakerError;
use crate::state::{AtomicState, CircuitState};
use events::{Observers, SubscriptionIds};
use timer::ResetTimer;

pub use events::{ServiceLevelChange, StateTransition, SubscriptionId};

struct Inner {
    name: String,
    state: AtomicState,
    failure_count: AtomicU32,
    threshold: AtomicU32,
    reset_timeout: RwLock<Duration>,
    timer: ResetTimer,
    subscription_ids: SubscriptionIds,
    state_observers: Observers<StateTransition>,
    service_level_observers: Observers<ServiceLevelChange>,
}

/// Circuit breaker guarding one logical dependency
///
/// Cloning is cheap and every clone shares the same state, so one breaker
/// can be handed to many threads or tasks.
///
/// # Example
///
/// ```
/// use reliable::{CircuitBreaker, CircuitBreakerError, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(2, Duration::from_secs(30)).unwrap();
///
/// let value = breaker.execute(|| Ok::<_, std::io::Error>(42)).unwrap();
/// assert_eq!(value, 42);
///
/// breaker.trip();
/// let refused = breaker.execute(|| Ok::<_, std::io::Error>(42));
/// assert!(matches!(refused, Err(CircuitBreakerError::Open)));
/// assert_eq!(breaker.state(), CircuitState::Open);
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::build(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a breaker tripping after `threshold` failures and probing
    /// again `reset_timeout` after opening
    pub fn new(threshold: u32, reset_timeout: Duration) -> Result<Self, ConfigError> {
        Self::from_config(
            CircuitBreakerConfig::default()
                .with_threshold(threshold)
                .with_reset_timeout(reset_timeout),
        )
    }

    /// Create a breaker from a validated configuration
    pub fn from_config(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: config.name,
                state: AtomicState::new(CircuitState::Closed),
                failure_count: AtomicU32::new(0),
                threshold: AtomicU32::new(config.threshold),
                reset_timeout: RwLock::new(config.reset_timeout),
                timer: ResetTimer::new(),
                subscription_ids: SubscriptionIds::default(),
                state_observers: Observers::new(),
                service_level_observers: Observers::new(),
            }),
        }
    }

    /// Name of the guarded dependency
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state of the circuit
    pub fn state(&self) -> CircuitState {
        self.inner.state.load()
    }

    /// Whether a call would currently be let through
    pub fn allowed_to_attempt_execute(&self) -> bool {
        self.state().admits_calls()
    }

    /// Current weighted failure tally
    pub fn failure_count(&self) -> u32 {
        self.inner.failure_count.load(Ordering::Acquire)
    }

    /// Number of failures at which the circuit trips
    pub fn threshold(&self) -> u32 {
        self.inner.threshold.load(Ordering::Acquire)
    }

    /// Change the threshold on a live breaker
    ///
    /// The current failure count is not re-checked against the new value;
    /// the next failure trips the circuit if the count is already at or
    /// above it.
    pub fn set_threshold(&self, threshold: u32) -> Result<(), ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        self.inner.threshold.store(threshold, Ordering::Release);
        Ok(())
    }

    /// Time the circuit stays open before probing
    pub fn reset_timeout(&self) -> Duration {
        *self.inner.reset_timeout.read()
    }

    /// Change the reset timeout; applies from the next time the circuit opens
    pub fn set_reset_timeout(&self, timeout: Duration) {
        *self.inner.reset_timeout.write() = timeout;
    }

    /// Health as a percentage: 100 is healthy, 0 means the threshold is reached
    pub fn service_level(&self) -> f64 {
        service_level(self.threshold(), self.failure_count())
    }

    /// Run `operation` through the circuit
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking the operation
    /// while the circuit is open. Any error from the operation is counted
    /// and handed back as [`CircuitBreakerError::OperationFailed`].
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;

        // No lock is held from here on: concurrent callers admitted above
        // all run before any outcome below is recorded.
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(cause) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(cause))
            }
        }
    }

    /// Async form of [`execute`](Self::execute)
    ///
    /// Suspends only while awaiting the operation's future. State is read
    /// again after the await, so a HalfOpen probe may observe a state that
    /// changed while it was suspended.
    pub async fn execute_async<T, E, F, Fut>(
        &self,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(cause) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(cause))
            }
        }
    }

    /// Force the circuit open. No effect if it is already open.
    pub fn trip(&self) {
        self.force(CircuitState::Open);
    }

    /// Force the circuit closed. No effect if it is already closed.
    ///
    /// The failure count is left as is.
    pub fn reset(&self) {
        self.force(CircuitState::Closed);
    }

    /// Register a callback fired after every state transition
    pub fn on_state_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        let id = self.inner.subscription_ids.next();
        self.inner.state_observers.subscribe(id, Arc::new(callback));
        id
    }

    /// Register a callback fired after every failure-count change
    pub fn on_service_level_changed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ServiceLevelChange) + Send + Sync + 'static,
    {
        let id = self.inner.subscription_ids.next();
        self.inner
            .service_level_observers
            .subscribe(id, Arc::new(callback));
        id
    }

    /// Remove a callback; returns false if the handle was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.state_observers.unsubscribe(id)
            | self.inner.service_level_observers.unsubscribe(id)
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        if self.state() == CircuitState::Open {
            debug!(breaker = %self.inner.name, "Call refused, circuit open");
            return Err(CircuitBreakerError::Open);
        }
        Ok(())
    }

    fn record_success(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.transition(CircuitState::HalfOpen, CircuitState::Closed);
        }

        let decremented = self.inner.failure_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
        if let Ok(previous) = decremented {
            self.notify_service_level(previous - 1);
        }
    }

    fn record_failure(&self) {
        // Any failed probe reopens the circuit, whatever the count
        if self.state() == CircuitState::HalfOpen {
            self.trip();
            return;
        }

        let threshold = self.threshold();
        let incremented = self.inner.failure_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| (count < threshold).then_some(count + 1),
        );

        match incremented {
            Ok(previous) => {
                let count = previous + 1;
                self.notify_service_level(count);
                if count >= threshold {
                    self.trip();
                }
            }
            // Already at or above the threshold (e.g. it was lowered)
            Err(_) => self.trip(),
        }
    }

    /// Move to `target` from whatever state the circuit is in
    fn force(&self, target: CircuitState) {
        loop {
            let current = self.state();
            if current == target || self.transition(current, target) {
                return;
            }
        }
    }

    /// Compare-and-set transition with timer upkeep, logging and notification
    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        if !self.inner.state.transition(from, to) {
            return false;
        }

        if to == CircuitState::Open {
            self.start_reset_timer();
        } else if from == CircuitState::Open {
            self.inner.timer.stop();
        }

        let name = &self.inner.name;
        match to {
            CircuitState::Open => warn!(
                breaker = %name,
                %from,
                failure_count = self.failure_count(),
                threshold = self.threshold(),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(breaker = %name, "Circuit breaker half-open, probing"),
            CircuitState::Closed => info!(breaker = %name, %from, "Circuit breaker closed"),
        }

        self.inner
            .state_observers
            .notify(&StateTransition { from, to });
        true
    }

    fn start_reset_timer(&self) {
        let timeout = self.reset_timeout();
        let weak = Arc::downgrade(&self.inner);

        debug!(breaker = %self.inner.name, ?timeout, "Reset timer started");
        self.inner.timer.start(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                // Ignored if the circuit already left Open
                CircuitBreaker { inner }.transition(CircuitState::Open, CircuitState::HalfOpen);
            }
        });
    }

    fn notify_service_level(&self, failure_count: u32) {
        if self.inner.service_level_observers.is_empty() {
            return;
        }

        let threshold = self.threshold();
        self.inner.service_level_observers.notify(&ServiceLevelChange {
            failure_count,
            threshold,
            service_level: service_level(threshold, failure_count),
        });
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("threshold", &self.threshold())
            .field("reset_timeout", &self.reset_timeout())
            .finish()
    }
}

fn service_level(threshold: u32, failure_count: u32) -> f64 {
    let threshold = f64::from(threshold.max(1));
    ((threshold - f64::from(failure_count)) / threshold * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn fail() -> Result<(), io::Error> {
        Err(io::Error::other("boom"))
    }

    fn succeed() -> Result<(), io::Error> {
        Ok(())
    }

    fn wait_for_state(breaker: &CircuitBreaker, expected: CircuitState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while breaker.state() != expected {
            assert!(
                Instant::now() < deadline,
                "breaker stuck in {} waiting for {}",
                breaker.state(),
                expected
            );
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_defaults() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.name(), "default");
        assert_eq!(breaker.threshold(), 5);
        assert_eq!(breaker.reset_timeout(), Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.service_level(), 100.0);
        assert!(breaker.allowed_to_attempt_execute());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = CircuitBreaker::new(0, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, ConfigError::InvalidThreshold);
    }

    #[test]
    fn test_execute_runs_operation_once() {
        let breaker = CircuitBreaker::default();
        let calls = AtomicUsize::new(0);

        breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                succeed()
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_execute_returns_result() {
        let breaker = CircuitBreaker::default();
        let result = breaker.execute(|| Ok::<_, io::Error>("payload")).unwrap();
        assert_eq!(result, "payload");
    }

    #[test]
    fn test_failure_wraps_cause() {
        let breaker = CircuitBreaker::default();
        let err = breaker.execute(fail).unwrap_err();

        match err {
            CircuitBreakerError::OperationFailed(cause) => assert_eq!(cause.to_string(), "boom"),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_trips_exactly_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(3600)).unwrap();

        let _ = breaker.execute(fail);
        let _ = breaker.execute(fail);
        assert_eq!(breaker.failure_count(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.execute(fail);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.service_level(), 0.0);
    }

    #[test]
    fn test_open_refuses_without_invoking() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(3600)).unwrap();
        let _ = breaker.execute(fail);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allowed_to_attempt_execute());

        let calls = AtomicUsize::new(0);
        let result = breaker.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            succeed()
        });

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_timeout_moves_to_half_open() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20)).unwrap();
        let _ = breaker.execute(fail);
        assert_eq!(breaker.state(), CircuitState::Open);

        wait_for_state(&breaker, CircuitState::HalfOpen);
        assert!(breaker.allowed_to_attempt_execute());
    }

    #[test]
    fn test_half_open_success_closes_and_decays() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10)).unwrap();
        let _ = breaker.execute(fail);
        let _ = breaker.execute(fail);
        wait_for_state(&breaker, CircuitState::HalfOpen);

        breaker.execute(succeed).unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.service_level(), 50.0);
    }

    #[test]
    fn test_half_open_failure_reopens_regardless_of_threshold() {
        let breaker = CircuitBreaker::new(100, Duration::from_millis(10)).unwrap();
        breaker.trip();
        wait_for_state(&breaker, CircuitState::HalfOpen);

        let _ = breaker.execute(fail);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_trip_and_reset_are_idempotent() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(3600)).unwrap();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        breaker.on_state_changed(move |t| seen.lock().push((t.from, t.to)));

        breaker.trip();
        breaker.trip();
        breaker.reset();
        breaker.reset();

        assert_eq!(
            *transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_reset_cancels_timer() {
        let breaker = CircuitBreaker::new(5, Duration::from_millis(30)).unwrap();
        breaker.trip();
        breaker.reset();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_service_level_notifications() {
        let breaker = CircuitBreaker::new(4, Duration::from_secs(3600)).unwrap();
        let levels = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&levels);
        breaker.on_service_level_changed(move |change| seen.lock().push(change.service_level));

        let _ = breaker.execute(fail);
        let _ = breaker.execute(fail);
        breaker.execute(succeed).unwrap();
        // No change at full health, no notification
        breaker.execute(succeed).unwrap();
        breaker.execute(succeed).unwrap();

        assert_eq!(*levels.lock(), vec![75.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let breaker = CircuitBreaker::default();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = breaker.on_state_changed(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        breaker.trip();
        assert!(breaker.unsubscribe(id));
        breaker.reset();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!breaker.unsubscribe(id));
    }

    #[test]
    fn test_callback_may_reenter_breaker() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(3600)).unwrap();
        let handle = breaker.clone();
        breaker.on_state_changed(move |t| {
            if t.to == CircuitState::Open {
                handle.reset();
            }
        });

        breaker.trip();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_set_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(3600)).unwrap();
        let _ = breaker.execute(fail);
        let _ = breaker.execute(fail);
        let _ = breaker.execute(fail);

        assert_eq!(breaker.set_threshold(0), Err(ConfigError::InvalidThreshold));
        assert_eq!(breaker.threshold(), 5);

        // Lowering below the current count is allowed; the next failure trips
        breaker.set_threshold(2).unwrap();
        assert_eq!(breaker.failure_count(), 3);
        assert_eq!(breaker.service_level(), 0.0);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.execute(fail);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_timeout_applies_to_next_opening() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(3600)).unwrap();
        breaker.trip();
        breaker.set_reset_timeout(Duration::from_millis(10));
        assert_eq!(breaker.reset_timeout(), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        breaker.trip();
        wait_for_state(&breaker, CircuitState::HalfOpen);
    }

    #[test]
    fn test_concurrent_callers_all_admitted_past_threshold() {
        const CALLERS: usize = 8;
        let breaker = CircuitBreaker::new(2, Duration::from_secs(3600)).unwrap();
        let barrier = Arc::new(Barrier::new(CALLERS));
        let invoked = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = Arc::clone(&barrier);
                let invoked = Arc::clone(&invoked);
                thread::spawn(move || {
                    breaker.execute(|| {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        // Hold every caller inside the operation until all were admitted
                        barrier.wait();
                        fail()
                    })
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_err());
        }

        // Every caller ran even though the threshold is 2
        assert_eq!(invoked.load(Ordering::SeqCst), CALLERS);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_execute_async() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(3600)).unwrap();

        let value = breaker
            .execute_async(|| async { Ok::<_, io::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = breaker
            .execute_async(|| async { Err::<(), _>(io::Error::other("down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitBreakerError::OperationFailed(_)));
        assert_eq!(breaker.state(), CircuitState::Open);

        let refused = breaker
            .execute_async(|| async { Ok::<_, io::Error>(()) })
            .await;
        assert!(matches!(refused, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn test_async_calls_in_flight_are_all_admitted() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(3600)).unwrap();
        let admitted = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let breaker = breaker.clone();
                let admitted = Arc::clone(&admitted);
                let mut rx = release_rx.clone();
                tokio::spawn(async move {
                    breaker
                        .execute_async(move || async move {
                            admitted.fetch_add(1, Ordering::SeqCst);
                            let _ = rx.changed().await;
                            Err::<(), _>(io::Error::other("late"))
                        })
                        .await
                })
            })
            .collect();

        while admitted.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        release_tx.send(true).unwrap();

        // Both were admitted while Closed, so both report the operation's failure
        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(CircuitBreakerError::OperationFailed(_))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_debug_output() {
        let breaker = CircuitBreaker::default();
        let debug = format!("{breaker:?}");
        assert!(debug.contains("CircuitBreaker"));
        assert!(debug.contains("Closed"));
    }
}
