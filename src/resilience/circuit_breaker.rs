//! # Circuit Breaker Implementation
//!
//! Three states: Closed (pass-through), Open (fail fast) and Half-Open (a single
//! trial call). The open window is measured from the most recent failure, so a
//! breaker that keeps failing keeps extending its own timeout.
//!
//! State and counters are atomics; the breaker is shared by reference across tasks
//! without a lock in the hot path. Elapsed time is measured with
//! [`tokio::time::Instant`] so paused-clock tests can drive the reset timeout.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lock-free call counters
#[derive(Debug, Default)]
struct AtomicCallCounters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_calls: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCallCounters {
    #[inline]
    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.total_duration_nanos.store(0, Ordering::Relaxed);
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - one trial call is allowed through
    HalfOpen = 2,
}

impl CircuitState {
    /// Numeric encoding used by gauges
    pub fn as_gauge_value(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),

    /// Circuit breaker configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Outcome of the admission check for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Trial,
    Rejected,
}

/// Core circuit breaker implementation with atomic state management
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Current circuit state
    state: AtomicU8,

    config: CircuitBreakerConfig,

    counters: AtomicCallCounters,

    /// Consecutive failures since the last success
    failure_count: AtomicU32,

    /// Monotonic origin for the offsets below
    origin: Instant,

    /// Nanos since `origin` of the last failure, plus one (0 = never failed)
    last_failure_offset: AtomicU64,

    /// Nanos since `origin` when the current trial started, plus one (0 = no trial)
    trial_started_offset: AtomicU64,

    /// Wall-clock millis of the last failure, for reporting only
    last_failure_epoch_millis: AtomicI64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            counters: AtomicCallCounters::default(),
            failure_count: AtomicU32::new(0),
            origin: Instant::now(),
            last_failure_offset: AtomicU64::new(0),
            trial_started_offset: AtomicU64::new(0),
            last_failure_epoch_millis: AtomicI64::new(0),
        }
    }

    /// Create a breaker after validating its configuration
    pub fn try_new(
        name: String,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerError<std::convert::Infallible>> {
        config
            .validate()
            .map_err(CircuitBreakerError::ConfigurationError)?;
        Ok(Self::new(name, config))
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Consecutive failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.admit() == Admission::Rejected {
            self.counters.rejected_calls.fetch_add(1, Ordering::Relaxed);
            debug!(component = %self.name, "Call rejected, circuit open");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    #[inline]
    fn now_offset(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }

    fn elapsed_since(&self, offset: u64) -> Duration {
        Duration::from_nanos(self.now_offset().saturating_sub(offset))
    }

    fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let last_failure = self.last_failure_offset.load(Ordering::Acquire);
                if last_failure != 0 && self.elapsed_since(last_failure) < self.config.reset_timeout
                {
                    return Admission::Rejected;
                }

                match self.state.compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.trial_started_offset
                            .store(self.now_offset(), Ordering::Release);
                        info!(component = %self.name, "Circuit breaker half-open (trial call)");
                        Admission::Trial
                    }
                    // Another caller won the transition and owns the trial
                    Err(_) => self.admit_half_open(),
                }
            }
            CircuitState::HalfOpen => self.admit_half_open(),
        }
    }

    /// Only one trial runs at a time; a trial that never reported back is
    /// replaced once the reset timeout passes again.
    fn admit_half_open(&self) -> Admission {
        let started = self.trial_started_offset.load(Ordering::Acquire);
        if started != 0 && self.elapsed_since(started) < self.config.reset_timeout {
            return Admission::Rejected;
        }

        let now = self.now_offset();
        match self.trial_started_offset.compare_exchange(
            started,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                warn!(component = %self.name, "Stale half-open trial replaced");
                Admission::Trial
            }
            Err(_) => Admission::Rejected,
        }
    }

    fn record_success(&self, duration: Duration) {
        self.counters.record_success(duration);
        self.failure_count.store(0, Ordering::Release);

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Operation succeeded"
        );

        if self.state() == CircuitState::HalfOpen {
            self.transition_to_closed();
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.counters.record_failure(duration);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_offset
            .store(self.now_offset(), Ordering::Release);
        self.last_failure_epoch_millis
            .store(Utc::now().timestamp_millis(), Ordering::Release);

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = failures,
            "Operation failed"
        );

        match self.state() {
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                self.transition_to_open()
            }
            _ => {}
        }
    }

    fn transition_to_closed(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.trial_started_offset.store(0, Ordering::Release);
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);

        info!(
            component = %self.name,
            total_calls = self.counters.total_calls.load(Ordering::Relaxed),
            "Circuit breaker closed (recovered)"
        );
    }

    fn transition_to_open(&self) {
        if self.last_failure_offset.load(Ordering::Acquire) == 0 {
            self.last_failure_offset
                .store(self.now_offset(), Ordering::Release);
        }
        self.trial_started_offset.store(0, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);

        warn!(
            component = %self.name,
            consecutive_failures = self.failure_count.load(Ordering::Relaxed),
            failure_threshold = self.config.failure_threshold,
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "Circuit breaker opened (failing fast)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        self.last_failure_offset
            .store(self.now_offset(), Ordering::Release);
        self.transition_to_open();
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.transition_to_closed();
    }

    /// Return to a fresh closed breaker and clear all counters
    pub fn reset(&self) {
        self.counters.reset();
        self.last_failure_offset.store(0, Ordering::Release);
        self.last_failure_epoch_millis.store(0, Ordering::Release);
        self.transition_to_closed();
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.counters.total_calls.load(Ordering::Relaxed);
        let total_nanos = self.counters.total_duration_nanos.load(Ordering::Relaxed);
        let average_duration = if total_calls > 0 {
            Duration::from_nanos(total_nanos / total_calls)
        } else {
            Duration::ZERO
        };
        let last_failure_millis = self.last_failure_epoch_millis.load(Ordering::Acquire);

        CircuitBreakerMetrics {
            name: self.name.clone(),
            current_state: self.state(),
            failure_count: self.failure_count(),
            last_failure_at: (last_failure_millis > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_failure_millis))
                .flatten(),
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
            total_calls,
            success_count: self.counters.success_count.load(Ordering::Relaxed),
            total_failures: self.counters.failure_count.load(Ordering::Relaxed),
            rejected_calls: self.counters.rejected_calls.load(Ordering::Relaxed),
            average_duration,
        }
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }

        let total_calls = self.counters.total_calls.load(Ordering::Relaxed);
        if total_calls < 10 {
            return true;
        }

        let failures = self.counters.failure_count.load(Ordering::Relaxed);
        (failures as f64 / total_calls as f64) < 0.1
    }

    /// Check if a call would currently be admitted, without starting a trial
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = self.last_failure_offset.load(Ordering::Acquire);
                last_failure == 0 || self.elapsed_since(last_failure) >= self.config.reset_timeout
            }
            CircuitState::HalfOpen => {
                let started = self.trial_started_offset.load(Ordering::Acquire);
                started == 0 || self.elapsed_since(started) >= self.config.reset_timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = breaker(3, 100);
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.total_failures, 0);
        assert!(metrics.last_failure_at.is_none());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let circuit = breaker(2, 1_000);
        let invocations = AtomicUsize::new(0);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 1);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let result = circuit
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.metrics().rejected_calls, 1);
        assert!(circuit.metrics().last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = breaker(3, 1_000);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        let _ = circuit.call(|| async { Ok::<_, &str>(()) }).await;
        assert_eq!(circuit.failure_count(), 0);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_circuit() {
        let circuit = breaker(1, 50);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.should_allow());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(circuit.should_allow());

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_circuit() {
        let circuit = breaker(2, 50);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(60)).await;
        let _ = circuit.call(|| async { Err::<(), _>("still down") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let result = circuit.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_while_half_open() {
        let circuit = Arc::new(breaker(1, 50));
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let circuit = Arc::clone(&circuit);
            tokio::spawn(async move {
                circuit
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let concurrent = circuit.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(concurrent, Err(CircuitBreakerError::CircuitOpen { .. })));

        let _ = release_tx.send(());
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_and_reset_operations() {
        let circuit = breaker(1, 1_000);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.should_allow());

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        circuit.reset();
        let metrics = circuit.metrics();
        assert_eq!(metrics.current_state, CircuitState::Closed);
        assert_eq!(metrics.total_calls, 0);
        assert!(metrics.last_failure_at.is_none());
    }

    #[test]
    fn test_try_new_validates_config() {
        let invalid = CircuitBreakerConfig {
            failure_threshold: 0,
            reset_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            CircuitBreaker::try_new("bad".to_string(), invalid),
            Err(CircuitBreakerError::ConfigurationError(_))
        ));
    }
}
