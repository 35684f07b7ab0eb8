//! # Error Handling
//!
//! [`MetricsError`] is the failure taxonomy shared by the recorder and the exporter.
//! Public operations wrap it in an [`OperationError`] that adds a stable
//! [`ErrorCode`], the breaker state when the failure happened, and how long the
//! operation ran. Expected failures are returned, never panicked.

use crate::resilience::{CircuitBreakerError, CircuitState};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for the metrics pipeline
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Malformed input that could not be defaulted
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Network or protocol failure, counted against the breaker
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Fast-fail without contacting the store
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Some events of a batch could not be written
    #[error("{failed} of {total} events in batch failed")]
    BatchPartialFailure { failed: usize, total: usize },

    /// Resource release failed; logged only
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Snapshot rendering failed
    #[error("Export error: {0}")]
    Export(String),

    /// The component was cleaned up and no longer accepts work
    #[error("{component} has been shut down")]
    ShutDown { component: String },
}

impl MetricsError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a shutdown error
    pub fn shut_down(component: impl Into<String>) -> Self {
        Self::ShutDown {
            component: component.into(),
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<CircuitBreakerError<StoreError>> for MetricsError {
    fn from(err: CircuitBreakerError<StoreError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => Self::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(store_error) => Self::Store(store_error),
            CircuitBreakerError::ConfigurationError(message) => Self::Configuration(message),
        }
    }
}

impl From<prometheus::Error> for MetricsError {
    fn from(err: prometheus::Error) -> Self {
        Self::Export(err.to_string())
    }
}

/// Stable error codes reported by public operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TrackingFailed,
    BatchProcessingFailed,
    AnalyticsFailed,
    ChannelAnalyticsFailed,
    UserAnalyticsFailed,
    AggregatedMetricsFailed,
    PrometheusExportFailed,
    CleanupFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TrackingFailed => "TRACKING_FAILED",
            ErrorCode::BatchProcessingFailed => "BATCH_PROCESSING_FAILED",
            ErrorCode::AnalyticsFailed => "ANALYTICS_FAILED",
            ErrorCode::ChannelAnalyticsFailed => "CHANNEL_ANALYTICS_FAILED",
            ErrorCode::UserAnalyticsFailed => "USER_ANALYTICS_FAILED",
            ErrorCode::AggregatedMetricsFailed => "AGGREGATED_METRICS_FAILED",
            ErrorCode::PrometheusExportFailed => "PROMETHEUS_EXPORT_FAILED",
            ErrorCode::CleanupFailed => "CLEANUP_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed outcome of a public operation
#[derive(Debug, Error)]
#[error("{code}: {source}")]
pub struct OperationError {
    pub code: ErrorCode,
    #[source]
    pub source: MetricsError,
    /// Breaker state observed when the operation finished
    pub circuit_state: CircuitState,
    pub duration: Duration,
}

impl OperationError {
    pub fn new(
        code: ErrorCode,
        source: impl Into<MetricsError>,
        circuit_state: CircuitState,
        duration: Duration,
    ) -> Self {
        Self {
            code,
            source: source.into(),
            circuit_state,
            duration,
        }
    }

    /// Whether the breaker rejected the call without touching the store
    pub fn is_circuit_open(&self) -> bool {
        self.source.is_circuit_open()
    }
}

/// Outcome of a public operation; `is_ok()` is the success flag
pub type OperationResult<T> = Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_render_as_wire_names() {
        assert_eq!(ErrorCode::TrackingFailed.to_string(), "TRACKING_FAILED");
        assert_eq!(
            serde_json::to_string(&ErrorCode::ChannelAnalyticsFailed).unwrap(),
            "\"CHANNEL_ANALYTICS_FAILED\""
        );
    }

    #[test]
    fn test_breaker_errors_map_into_taxonomy() {
        let open: MetricsError = CircuitBreakerError::<StoreError>::CircuitOpen {
            component: "recorder".to_string(),
        }
        .into();
        assert!(open.is_circuit_open());

        let failed: MetricsError =
            CircuitBreakerError::OperationFailed(StoreError::NotConnected).into();
        assert!(matches!(failed, MetricsError::Store(StoreError::NotConnected)));
    }

    #[test]
    fn test_operation_error_display_includes_code() {
        let error = OperationError::new(
            ErrorCode::AnalyticsFailed,
            MetricsError::validation("bot_name", "required"),
            CircuitState::Closed,
            Duration::ZERO,
        );
        let rendered = error.to_string();
        assert!(rendered.starts_with("ANALYTICS_FAILED"));
        assert!(rendered.contains("bot_name"));
    }
}
