//! Errors surfaced by the breaker, the retry loop and the bulk runners
//!
//! All three are generic over `E`, the error type of the guarded operation,
//! so callers get their own error values back untouched.

use thiserror::Error;

/// Outcome of a single call through [`CircuitBreaker::execute`](crate::CircuitBreaker::execute)
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and returned an error
    #[error("operation failed: {0}")]
    OperationFailed(#[source] E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was refused without running
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The operation's own error, if the operation ran
    pub fn into_cause(self) -> Option<E> {
        match self {
            Self::Open => None,
            Self::OperationFailed(cause) => Some(cause),
        }
    }
}

/// Terminal error of a retry loop
///
/// Exactly one of these is returned per exhausted loop. `Open` means the
/// breaker never let a single attempt through; `Aggregate` means the
/// dependency itself kept failing.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt was refused by an open circuit
    #[error("retries exhausted after {attempts} attempts while the circuit breaker was open")]
    Open { attempts: u32 },

    /// At least one attempt ran and failed
    #[error("operation failed on {} of {attempts} attempts", .failures.len())]
    Aggregate {
        /// Total attempts made, refusals included
        attempts: u32,
        /// Operation errors in attempt order, refusals excluded
        failures: Vec<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts consumed, refused ones included
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Open { attempts } | Self::Aggregate { attempts, .. } => *attempts,
        }
    }

    /// Recorded operation errors (empty for `Open`)
    pub fn failures(&self) -> &[E] {
        match self {
            Self::Open { .. } => &[],
            Self::Aggregate { failures, .. } => failures,
        }
    }

    /// Whether the loop was exhausted purely by refusals
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Failures collected from a parallel bulk run, keyed by element index
#[derive(Debug, Error)]
#[error("{} element(s) failed in parallel run", .failures.len())]
pub struct BulkError<E> {
    /// `(index, error)` pairs ordered by element index
    pub failures: Vec<(usize, RetryError<E>)>,
}
