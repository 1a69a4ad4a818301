//! Circuit breaker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of failures before the circuit trips
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before probing
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Threshold was zero
    #[error("circuit breaker threshold must be greater than zero")]
    InvalidThreshold,

    /// Breaker name was blank
    #[error("circuit breaker name must not be empty")]
    EmptyName,
}

/// Circuit breaker configuration
///
/// Each breaker guards one logical dependency. When `threshold` weighted
/// failures accumulate, the circuit opens and calls fail fast until
/// `reset_timeout` has elapsed.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure_count == threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ───────────────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                              └─────────┘                 └──────────┘
///      ▲                                        ▲         any failure       │
///      │                                        └───────────────────────────┤
///      │                   one success                                      │
///      └────────────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use reliable::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::new("inventory-db")
///     .with_threshold(10)
///     .with_reset_timeout(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Name of the guarded dependency, carried into log fields
    pub name: String,

    /// Number of failures required to open the circuit
    pub threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            threshold: DEFAULT_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration for a named dependency with default limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold to open the circuit
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the reset timeout (time before probing again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(())
    }
}
