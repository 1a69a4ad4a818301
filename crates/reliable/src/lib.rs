//! # Reliable
//!
//! In-process resiliency primitives for code that calls unreliable dependencies.
//!
//! ## Features
//!
//! - **Circuit breaker**: Stops calling a failing dependency once a failure threshold is reached
//! - **Automatic recovery**: An open circuit probes the dependency again after a reset timeout
//! - **Fixed-interval retries**: Retry loops that respect the breaker and aggregate every failure
//! - **Bulk execution**: Sequential or bounded-parallel runs over many elements through one breaker
//! - **Observability**: State and service-level change callbacks plus `tracing` events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            bulk::for_each / bulk::parallel_for_each          │
//! │  (one retry loop per element, bounded by a semaphore)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             CircuitBreaker::execute_with_retries             │
//! │  (fixed interval, refusals count, failures aggregated)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CircuitBreaker::execute                      │
//! │  (Closed ──► Open ──► HalfOpen ──► Closed, reset timer)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use reliable::prelude::*;
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(3, Duration::from_secs(30)).unwrap();
//! let options = RetryOptions::no_delay(2);
//!
//! let value = breaker
//!     .execute_with_retries(|| Ok::<_, std::io::Error>(42), &options)
//!     .unwrap();
//!
//! assert_eq!(value, 42);
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! assert_eq!(breaker.service_level(), 100.0);
//! ```

pub mod breaker;
pub mod bulk;
pub mod config;
pub mod error;
pub mod retry;
pub mod state;

mod serde_millis;

pub use breaker::{CircuitBreaker, ServiceLevelChange, StateTransition, SubscriptionId};
pub use config::{CircuitBreakerConfig, ConfigError};
pub use error::{BulkError, CircuitBreakerError, RetryError};
pub use retry::RetryOptions;
pub use state::CircuitState;

/// Prelude for common imports
pub mod prelude {
    pub use crate::breaker::{CircuitBreaker, ServiceLevelChange, StateTransition, SubscriptionId};
    pub use crate::bulk::{for_each, for_each_async, parallel_for_each};
    pub use crate::config::{CircuitBreakerConfig, ConfigError};
    pub use crate::error::{BulkError, CircuitBreakerError, RetryError};
    pub use crate::retry::RetryOptions;
    pub use crate::state::CircuitState;
}
