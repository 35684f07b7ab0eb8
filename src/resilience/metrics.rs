//! # Circuit Breaker Metrics
//!
//! Point-in-time view of a breaker: the state machine fields (state, failure count,
//! last failure, threshold, reset timeout) plus lifetime call counters.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot of a single circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name used in logs
    pub name: String,

    /// Current circuit breaker state
    pub current_state: CircuitState,

    /// Consecutive failures since the last success
    pub failure_count: u32,

    /// Wall-clock time of the most recent failure
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Failures required to open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open after the last failure
    pub reset_timeout: Duration,

    /// Calls that reached the protected operation
    pub total_calls: u64,

    /// Calls that succeeded
    pub success_count: u64,

    /// Calls that failed (lifetime, not consecutive)
    pub total_failures: u64,

    /// Calls rejected without invoking the operation
    pub rejected_calls: u64,

    /// Average duration of executed calls
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Lifetime failure rate over executed calls (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }

        self.total_failures as f64 / self.total_calls as f64
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate() < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing store health",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "{}: {} | Calls: {} | Failures: {} ({} consecutive) | Rejected: {} | Avg Duration: {}ms",
            self.name,
            self.state_description(),
            self.total_calls,
            self.total_failures,
            self.failure_count,
            self.rejected_calls,
            self.average_duration.as_millis()
        )
    }
}
