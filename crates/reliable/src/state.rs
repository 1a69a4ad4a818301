//! Circuit breaker admission states

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed = 0,

    /// Failure threshold reached - all calls rejected without running
    Open = 1,

    /// Reset timeout elapsed - the next outcome decides Closed or Open
    HalfOpen = 2,
}

impl CircuitState {
    /// Whether a call is let through in this state
    pub fn admits_calls(self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            _ => Self::HalfOpen,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Lock-free cell holding a [`CircuitState`]
///
/// Transitions go through [`AtomicState::transition`], a single
/// compare-and-set, so two racing transitions out of the same state
/// cannot both win.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: CircuitState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> CircuitState {
        CircuitState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns false if the state was not `from`
    pub(crate) fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
