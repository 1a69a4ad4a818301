//! Cancellable one-shot reset timer
//!
//! Each `start` spawns a short-lived thread that waits on a condvar until
//! its deadline. Starting or stopping the timer bumps an epoch counter and
//! wakes the waiter; a waiter whose epoch is no longer current exits
//! without firing. The timer needs no async runtime, so breakers driven
//! only from synchronous code still move from Open to HalfOpen.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

struct Shared {
    epoch: Mutex<u64>,
    wake: Condvar,
}

impl Shared {
    /// Block until `deadline` or until `epoch` is superseded
    ///
    /// Returns true if the deadline passed first. The epoch is consumed on
    /// firing, so one armed timer fires at most once.
    fn wait(&self, epoch: u64, deadline: Option<Instant>) -> bool {
        let mut current = self.epoch.lock();
        while *current == epoch {
            let timed_out = match deadline {
                Some(deadline) => self.wake.wait_until(&mut current, deadline).timed_out(),
                None => {
                    self.wake.wait(&mut current);
                    false
                }
            };

            if timed_out && *current == epoch {
                *current += 1;
                return true;
            }
        }
        false
    }
}

pub(crate) struct ResetTimer {
    shared: Arc<Shared>,
}

impl ResetTimer {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                epoch: Mutex::new(0),
                wake: Condvar::new(),
            }),
        }
    }

    /// Arm the timer, cancelling any earlier arming
    pub(crate) fn start<F>(&self, timeout: Duration, on_elapsed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = self.advance();
        let shared = Arc::clone(&self.shared);
        // Overflowing deadline means "never"; only a stop() ends the wait
        let deadline = Instant::now().checked_add(timeout);

        let spawned = thread::Builder::new()
            .name("circuit-reset-timer".to_string())
            .spawn(move || {
                if shared.wait(epoch, deadline) {
                    on_elapsed();
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn circuit breaker reset timer");
        }
    }

    /// Cancel the armed timer, if any
    pub(crate) fn stop(&self) {
        self.advance();
    }

    fn advance(&self) -> u64 {
        let mut epoch = self.shared.epoch.lock();
        *epoch += 1;
        self.shared.wake.notify_all();
        *epoch
    }
}

impl Drop for ResetTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
