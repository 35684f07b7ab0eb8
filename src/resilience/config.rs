//! # Circuit Breaker Configuration
//!
//! Runtime configuration for a single breaker. File-level settings live in
//! [`crate::config::CircuitBreakerSettings`] and convert into this type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time since the last failure before a trial call is allowed
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Settings used by the trigger event recorder (write path)
    pub fn for_recorder() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
        }
    }

    /// Settings used by the metrics exporter (read path)
    pub fn for_exporter() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(30_000),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        if self.reset_timeout > Duration::from_secs(3600) {
            return Err("reset_timeout should not exceed 3600 seconds".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_recorder()
    }
}
