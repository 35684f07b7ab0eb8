#![allow(clippy::doc_markdown)] // Allow technical terms like Redis, Prometheus in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Trigger Metrics
//!
//! Fault-tolerant metrics pipeline for chat-bot trigger events.
//!
//! ## Overview
//!
//! Bots emit one [`TriggerEvent`] per trigger. The [`TriggerEventRecorder`]
//! writes it into counter hashes in a shared key-value store, either directly
//! or through a batching queue. The [`MetricsExporter`] independently scans
//! that store and renders a cached Prometheus exposition. Each side guards its
//! store calls with its own [`CircuitBreaker`], so an outage on one path never
//! disables the other.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit breaker shared by the recorder and the exporter
//! - [`store`] - Event store trait, key layout, write script, Redis and in-memory providers
//! - [`events`] - Trigger event model, time ranges, query filters
//! - [`recorder`] - Write path and analytics queries
//! - [`exporter`] - Cached exposition snapshot
//! - [`health`] - Combined health of store and breakers
//! - [`config`] - Layered configuration
//! - [`error`] - Error taxonomy and operation outcomes
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trigger_metrics::config::TriggerMetricsConfig;
//! use trigger_metrics::events::TriggerEvent;
//! use trigger_metrics::{build_store, MetricsExporter, TriggerEventRecorder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! trigger_metrics::logging::init_structured_logging();
//! let config = TriggerMetricsConfig::default();
//! let store = build_store(&config.store)?;
//!
//! let recorder = Arc::new(TriggerEventRecorder::new(store.clone(), config.recorder.clone())?);
//! recorder
//!     .track_bot_trigger(TriggerEvent::new("EzioBot", "assassin", "u1", "c1", "m1"))
//!     .await?;
//!
//! let exporter = MetricsExporter::new(config.exporter.clone())?;
//! exporter.initialize(store, Some(recorder.clone())).await?;
//! let exposition = exporter.export_metrics().await;
//! println!("{exposition}");
//!
//! exporter.shutdown().await;
//! recorder.cleanup().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Tests run against [`store::MemoryEventStore`], so no live Redis is needed:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod health;
pub mod logging;
pub mod recorder;
pub mod resilience;
pub mod store;

pub use config::{
    ConfigLoader, ExporterConfig, HealthConfig, RecorderConfig, StoreConfig, TriggerMetricsConfig,
    WriteMode,
};
pub use error::{ErrorCode, MetricsError, OperationError, OperationResult};
pub use events::{AggregationPeriod, MetricsFilter, ResponseKind, TimeRange, TriggerEvent};
pub use exporter::{ExporterStats, MetricsExporter};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use recorder::{BatchOperationResult, RecorderHealth, TriggerEventRecorder};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use store::{build_store, EventStore, MemoryEventStore, StoreError};
