//! Recorder operation metrics

use crate::error::MetricsError;
use crate::resilience::CircuitState;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Metrics about the recorder itself, kept in a private registry
#[derive(Clone)]
pub struct RecorderTelemetry {
    registry: Registry,
    operations: IntCounterVec,
    operation_duration: HistogramVec,
    batch_size: Histogram,
    fallback_writes: IntCounter,
    circuit_breaker_state: IntGauge,
    pending_events: IntGauge,
}

impl std::fmt::Debug for RecorderTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderTelemetry")
            .field("fallback_writes", &self.fallback_writes.get())
            .finish_non_exhaustive()
    }
}

impl RecorderTelemetry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "trigger_recorder_operations_total",
                "Recorder operations by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "trigger_recorder_operation_duration_seconds",
                "Time spent in recorder operations",
            ),
            &["operation"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("trigger_recorder_batch_size", "Events written per flush or batch call")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )?;
        let fallback_writes = IntCounter::new(
            "trigger_recorder_fallback_writes_total",
            "Events written through the non-atomic pipeline path",
        )?;
        let circuit_breaker_state = IntGauge::new(
            "trigger_recorder_circuit_breaker_state",
            "Recorder circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
        )?;
        let pending_events = IntGauge::new(
            "trigger_recorder_pending_events",
            "Events queued for the next flush",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(fallback_writes.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(pending_events.clone()))?;

        Ok(Self {
            registry,
            operations,
            operation_duration,
            batch_size,
            fallback_writes,
            circuit_breaker_state,
            pending_events,
        })
    }

    pub fn record_operation(&self, operation: &str, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_batch(&self, size: usize) {
        self.batch_size.observe(size as f64);
    }

    pub fn record_fallback_write(&self) {
        self.fallback_writes.inc();
    }

    /// Render the registry after refreshing the point-in-time gauges
    pub fn render(&self, state: CircuitState, pending: usize) -> Result<String, MetricsError> {
        self.circuit_breaker_state.set(state.as_gauge_value());
        self.pending_events.set(pending as i64);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Export(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_operations_and_state() {
        let telemetry = RecorderTelemetry::new().unwrap();
        telemetry.record_operation("track_bot_trigger", true, Duration::from_millis(4));
        telemetry.record_operation("track_bot_trigger", false, Duration::from_millis(9));
        telemetry.record_batch(3);

        let text = telemetry.render(CircuitState::Open, 7).unwrap();
        assert!(text.contains(
            "trigger_recorder_operations_total{operation=\"track_bot_trigger\",outcome=\"failure\"} 1"
        ));
        assert!(text.contains("trigger_recorder_circuit_breaker_state 1"));
        assert!(text.contains("trigger_recorder_pending_events 7"));
        assert!(text.contains("trigger_recorder_batch_size_count 1"));
    }
}
