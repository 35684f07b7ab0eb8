//! # Trigger Event Recorder
//!
//! Accepts trigger events from the bot pipeline, writes them to the shared
//! [`EventStore`] through its own [`CircuitBreaker`], and answers aggregation
//! queries over what was written.
//!
//! ## Write modes
//!
//! - **Direct**: every event is written before `track_bot_trigger` returns.
//! - **Batched**: events are queued and flushed in arrival order when the queue
//!   reaches `batch_size` or `batch_flush_interval_ms` has passed since the last
//!   flush. The interval flush runs on a task owned by the recorder and stopped
//!   by [`TriggerEventRecorder::cleanup`].
//!
//! Each write tries the atomic script first and falls back to pipelined
//! commands (see [`writer`]).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trigger_metrics::config::RecorderConfig;
//! use trigger_metrics::events::{MetricsFilter, TriggerEvent};
//! use trigger_metrics::recorder::TriggerEventRecorder;
//! use trigger_metrics::store::MemoryEventStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryEventStore::new());
//! let recorder = TriggerEventRecorder::new(store, RecorderConfig::direct())?;
//!
//! let event = TriggerEvent::new("EzioBot", "assassin", "user-1", "channel-1", "message-1")
//!     .with_response_time_ms(100);
//! recorder.track_bot_trigger(event).await?;
//!
//! let metrics = recorder
//!     .get_bot_metrics(&MetricsFilter::for_bot("EzioBot"), None)
//!     .await?;
//! assert_eq!(metrics.total_triggers, 1);
//!
//! recorder.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod batch;
pub mod telemetry;
pub mod writer;

pub use analytics::{
    BotActivity, BotAnalytics, BotMetricsAggregation, ChannelAnalytics, ConditionCount,
    HourlyTrendPoint, ResponseTimeStats, UserAnalytics,
};
pub use batch::{BatchQueue, BatchStats};
pub use telemetry::RecorderTelemetry;
pub use writer::{FallbackWriter, PipelineWriter, PreparedWrite, ScriptWriter, WritePath, WriteStrategy};

use crate::config::{RecorderConfig, RetentionConfig, WriteMode};
use crate::error::{ErrorCode, MetricsError, OperationError, OperationResult};
use crate::events::{AggregationPeriod, MetricsFilter, TimeRange, TriggerEvent};
use crate::health::HealthStatus;
use crate::logging::log_store_operation;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::store::{keys, EventStore, StoreCommand, StoreResult, StoreValue};
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "trigger_recorder";

/// Longest range for which hourly trend points are read
const MAX_TREND_HOURS: i64 = 168;

/// Per-event outcome of [`TriggerEventRecorder::track_batch_triggers`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEventFailure {
    pub index: usize,
    pub trigger_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperationResult {
    pub successful: usize,
    pub failed: usize,
    pub processing_time_ms: u64,
    pub failures: Vec<BatchEventFailure>,
}

/// Outcome of one non-empty flush of the batch queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Failed events returned to the queue for the next flush
    pub requeued: usize,
    pub duration: Duration,
}

/// Recorder view used by health checks and the exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderHealth {
    pub status: HealthStatus,
    pub store_connected: bool,
    pub store_latency_ms: Option<u64>,
    pub store_error: Option<String>,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub error_rate: f64,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub pending_events: usize,
    pub uptime_secs: u64,
}

/// State shared between the recorder and its flush task
#[derive(Debug)]
struct RecorderCore {
    store: Arc<dyn EventStore>,
    breaker: CircuitBreaker,
    writer: FallbackWriter,
    retention: RetentionConfig,
    telemetry: RecorderTelemetry,
    queue: Option<BatchQueue>,
}

impl RecorderCore {
    /// Write one event through the breaker
    async fn persist(&self, event: &TriggerEvent) -> Result<(), MetricsError> {
        let write = PreparedWrite::from_event(event, &self.retention)?;
        let path = self
            .breaker
            .call(|| self.writer.write(self.store.as_ref(), &write))
            .await?;
        if path == WritePath::Fallback {
            self.telemetry.record_fallback_write();
        }
        Ok(())
    }

    /// Run read commands in one pipeline through the breaker
    async fn read(&self, commands: &[StoreCommand]) -> Result<Vec<StoreValue>, MetricsError> {
        let replies = self
            .breaker
            .call(|| async {
                self.store
                    .pipeline(commands)
                    .await?
                    .into_iter()
                    .collect::<StoreResult<Vec<StoreValue>>>()
            })
            .await?;
        Ok(replies)
    }

    /// Write every queued event; `None` if the queue was empty or already flushing
    async fn flush_pending(&self) -> Option<FlushReport> {
        let queue = self.queue.as_ref()?;
        let guard = queue.try_begin_flush()?;
        let events = queue.drain(&guard);
        if events.is_empty() {
            return None;
        }

        let started = Instant::now();
        let total = events.len();
        let mut written = 0;
        let mut failed = 0;
        let mut retry = Vec::new();

        for event in events {
            match self.persist(&event).await {
                Ok(()) => written += 1,
                // Part of the update already landed, so a retry would double count it
                Err(MetricsError::Store(crate::store::StoreError::PartialWrite { .. })) => {
                    failed += 1;
                }
                Err(_) => {
                    failed += 1;
                    retry.push(event);
                }
            }
        }

        let requeued = retry.len();
        queue.complete(&guard, written, retry);
        self.telemetry.record_batch(total);

        let report = FlushReport {
            written,
            failed,
            requeued,
            duration: started.elapsed(),
        };
        if failed == 0 {
            debug!(
                events = total,
                duration_ms = report.duration.as_millis() as u64,
                "Flushed trigger event batch"
            );
        } else {
            warn!(
                error = %MetricsError::BatchPartialFailure { failed, total },
                requeued = requeued,
                circuit_state = %self.breaker.state(),
                "Trigger event batch flush incomplete"
            );
        }
        Some(report)
    }

    fn pending_events(&self) -> usize {
        self.queue.as_ref().map_or(0, BatchQueue::len)
    }
}

/// Interval flush loop; size-triggered flushes happen inline in the caller
fn spawn_flush_worker(
    core: Arc<RecorderCore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(queue) = core.queue.as_ref() else {
            return;
        };
        debug!(
            interval_ms = queue.flush_interval().as_millis() as u64,
            "Batch flush task started"
        );

        loop {
            let deadline = queue.next_deadline();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Batch flush task shutting down");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // A size-triggered flush moved the deadline while we slept
                    if queue.next_deadline() > Instant::now() {
                        continue;
                    }
                    if core.flush_pending().await.is_none() {
                        queue.touch();
                    }
                }
            }
        }
    })
}

/// Records trigger events and answers queries over them
#[derive(Debug)]
pub struct TriggerEventRecorder {
    config: RecorderConfig,
    core: Arc<RecorderCore>,
    initialized: OnceCell<()>,
    cleaned_up: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
    total_operations: AtomicU64,
    failed_operations: AtomicU64,
}

impl TriggerEventRecorder {
    /// Create a recorder over a shared store. Nothing is contacted until the
    /// first operation.
    pub fn new(store: Arc<dyn EventStore>, config: RecorderConfig) -> Result<Self, MetricsError> {
        let breaker = CircuitBreaker::try_new(
            COMPONENT.to_string(),
            config.circuit_breaker.to_resilience_config(),
        )
        .map_err(|e| MetricsError::Configuration(e.to_string()))?;

        let queue = match config.mode {
            WriteMode::Direct => None,
            WriteMode::Batched => Some(BatchQueue::new(
                config.batch_size,
                config.max_pending_events,
                config.batch_flush_interval(),
            )),
        };

        let core = RecorderCore {
            store,
            breaker,
            writer: FallbackWriter::default(),
            retention: config.retention.clone(),
            telemetry: RecorderTelemetry::new()?,
            queue,
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            core: Arc::new(core),
            initialized: OnceCell::new(),
            cleaned_up: AtomicBool::new(false),
            shutdown_tx,
            worker: parking_lot::Mutex::new(None),
            started_at: Instant::now(),
            total_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.core.store
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.core.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.core.breaker.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::Acquire)
    }

    /// Events queued and not yet written
    pub fn pending_events(&self) -> usize {
        self.core.pending_events()
    }

    /// Queue counters; `None` in direct mode
    pub fn batch_stats(&self) -> Option<BatchStats> {
        self.core.queue.as_ref().map(BatchQueue::stats)
    }

    /// Record one trigger decision
    pub async fn track_bot_trigger(&self, event: TriggerEvent) -> OperationResult<()> {
        self.run("track_bot_trigger", ErrorCode::TrackingFailed, async {
            self.ensure_initialized().await?;
            let mut event = event;
            self.normalize(&mut event);

            match &self.core.queue {
                None => self.core.persist(&event).await,
                Some(queue) => {
                    if queue.push(event) {
                        self.core.flush_pending().await;
                    }
                    Ok(())
                }
            }
        })
        .await
    }

    /// Alias of [`track_bot_trigger`](Self::track_bot_trigger) for the bot pipeline
    pub async fn record(&self, event: TriggerEvent) -> OperationResult<()> {
        self.track_bot_trigger(event).await
    }

    /// Write a batch of events directly, continuing past individual failures
    pub async fn track_batch_triggers(
        &self,
        events: Vec<TriggerEvent>,
    ) -> OperationResult<BatchOperationResult> {
        self.run("track_batch_triggers", ErrorCode::BatchProcessingFailed, async {
            self.ensure_initialized().await?;
            let started = Instant::now();
            let total = events.len();
            let mut result = BatchOperationResult::default();

            for (index, mut event) in events.into_iter().enumerate() {
                self.normalize(&mut event);
                match self.core.persist(&event).await {
                    Ok(()) => result.successful += 1,
                    Err(error) => {
                        result.failed += 1;
                        result.failures.push(BatchEventFailure {
                            index,
                            trigger_id: event.trigger_id,
                            error: error.to_string(),
                        });
                    }
                }
            }

            result.processing_time_ms = started.elapsed().as_millis() as u64;
            self.core.telemetry.record_batch(total);
            if result.failed > 0 {
                warn!(
                    error = %MetricsError::BatchPartialFailure { failed: result.failed, total },
                    circuit_state = %self.core.breaker.state(),
                    "Trigger batch partially failed"
                );
            }
            Ok(result)
        })
        .await
    }

    /// Write every queued event now
    pub async fn flush(&self) -> Option<FlushReport> {
        self.core.flush_pending().await
    }

    /// Analytics for the bot named by `filter.bot_name`
    pub async fn get_bot_metrics(
        &self,
        filter: &MetricsFilter,
        time_range: Option<TimeRange>,
    ) -> OperationResult<BotAnalytics> {
        self.run("get_bot_metrics", ErrorCode::AnalyticsFailed, async {
            let bot_name = filter
                .primary_bot()
                .ok_or_else(|| MetricsError::validation("bot_name", "a bot name is required"))?;
            self.ensure_initialized().await?;
            let range = self.resolve_range(time_range);

            let mut commands = vec![
                StoreCommand::hgetall(keys::bot_stats(bot_name)),
                StoreCommand::hgetall(keys::bot_conditions(bot_name)),
                StoreCommand::zrangebyscore(
                    keys::bot_performance(bot_name),
                    range.start_ms() as f64,
                    range.end_ms() as f64,
                    None,
                ),
            ];
            let hours = if range.duration() <= TimeDelta::hours(MAX_TREND_HOURS) {
                range
                    .with_period(AggregationPeriod::Hour)
                    .bucket_keys(MAX_TREND_HOURS as usize + 1)
            } else {
                Vec::new()
            };
            commands.extend(
                hours
                    .iter()
                    .map(|hour| StoreCommand::hgetall(keys::bot_hourly(bot_name, hour))),
            );

            let mut replies = self.core.read(&commands).await?.into_iter();
            let readings = analytics::BotReadings {
                stats: replies.next().unwrap_or_default().into_hash(),
                conditions: replies.next().unwrap_or_default().into_hash(),
                performance_members: replies.next().unwrap_or_default().into_members(),
                hourly: hours
                    .into_iter()
                    .zip(replies.map(StoreValue::into_hash))
                    .collect(),
            };

            Ok(analytics::bot_analytics(
                bot_name,
                range,
                readings,
                self.config.top_conditions_limit,
            ))
        })
        .await
    }

    pub async fn get_channel_metrics(
        &self,
        channel_id: &str,
        time_range: Option<TimeRange>,
    ) -> OperationResult<ChannelAnalytics> {
        self.run("get_channel_metrics", ErrorCode::ChannelAnalyticsFailed, async {
            let channel_id = required("channel_id", channel_id)?;
            self.ensure_initialized().await?;
            let range = self.resolve_range(time_range);

            let hash = self.read_hash(keys::channel_activity(channel_id)).await?;
            Ok(analytics::channel_analytics(channel_id, range, &hash))
        })
        .await
    }

    pub async fn get_user_metrics(
        &self,
        user_id: &str,
        time_range: Option<TimeRange>,
    ) -> OperationResult<UserAnalytics> {
        self.run("get_user_metrics", ErrorCode::UserAnalyticsFailed, async {
            let user_id = required("user_id", user_id)?;
            self.ensure_initialized().await?;
            let range = self.resolve_range(time_range);

            let hash = self.read_hash(keys::user_interactions(user_id)).await?;
            Ok(analytics::user_analytics(user_id, range, &hash))
        })
        .await
    }

    /// Per-bot, per-bucket counters for every bot the filter names
    pub async fn get_aggregated_metrics(
        &self,
        filter: &MetricsFilter,
        time_range: TimeRange,
    ) -> OperationResult<Vec<BotMetricsAggregation>> {
        self.run("get_aggregated_metrics", ErrorCode::AggregatedMetricsFailed, async {
            let bots = filter.all_bots();
            if bots.is_empty() {
                return Ok(Vec::new());
            }
            self.ensure_initialized().await?;

            let period = time_range.period;
            let buckets = time_range.bucket_keys(self.config.max_aggregation_buckets);
            let slots: Vec<(&str, &str)> = bots
                .iter()
                .flat_map(|bot| buckets.iter().map(move |bucket| (bot.as_str(), bucket.as_str())))
                .collect();
            let commands: Vec<StoreCommand> = slots
                .iter()
                .map(|(bot, bucket)| {
                    StoreCommand::hgetall(match period {
                        AggregationPeriod::Hour => keys::bot_hourly(bot, bucket),
                        AggregationPeriod::Day => keys::bot_daily(bot, bucket),
                    })
                })
                .collect();

            let replies = self.core.read(&commands).await?;
            Ok(slots
                .into_iter()
                .zip(replies)
                .filter_map(|((bot, bucket), reply)| {
                    analytics::bucket_aggregation(bot, period, bucket, &reply.into_hash())
                })
                .collect())
        })
        .await
    }

    /// Store connectivity, breaker state and error rate as one status
    pub async fn get_health_status(&self) -> RecorderHealth {
        let ping = tokio::time::timeout(
            self.config.health_check_timeout(),
            self.core.store.ping(),
        )
        .await;
        let (store_latency_ms, store_error) = match ping {
            Ok(Ok(latency)) => (Some(latency.as_millis() as u64), None),
            Ok(Err(error)) => (None, Some(error.to_string())),
            Err(_) => (
                None,
                Some(format!(
                    "ping timed out after {}ms",
                    self.config.health_check_timeout_ms
                )),
            ),
        };

        let total_operations = self.total_operations.load(Ordering::Relaxed);
        let failed_operations = self.failed_operations.load(Ordering::Relaxed);
        let error_rate = if total_operations == 0 {
            0.0
        } else {
            failed_operations as f64 / total_operations as f64
        };
        let store_connected = store_error.is_none() && !self.is_cleaned_up();
        let circuit_state = self.core.breaker.state();

        RecorderHealth {
            status: HealthStatus::classify(store_connected, circuit_state, error_rate),
            store_connected,
            store_latency_ms,
            store_error,
            circuit_state,
            failure_count: self.core.breaker.failure_count(),
            error_rate,
            total_operations,
            failed_operations,
            pending_events: self.pending_events(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// The recorder's own operation metrics in exposition format
    pub async fn export_prometheus_metrics(&self) -> OperationResult<String> {
        self.run("export_prometheus_metrics", ErrorCode::PrometheusExportFailed, async {
            self.core
                .telemetry
                .render(self.core.breaker.state(), self.pending_events())
        })
        .await
    }

    /// Stop the flush task, write what is queued and close the store.
    /// Idempotent; failures are logged and never returned.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            debug!("Trigger event recorder already cleaned up");
            return;
        }

        let _ = self.shutdown_tx.send(());
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                self.log_cleanup_failure(format!("flush task ended abnormally: {e}"));
            }
        }

        if !self.is_initialized() {
            info!("Trigger event recorder cleaned up before first use");
            return;
        }

        if let Some(report) = self.core.flush_pending().await {
            if report.failed > 0 {
                self.log_cleanup_failure(format!(
                    "{} of {} pending events could not be written",
                    report.failed,
                    report.written + report.failed
                ));
            }
        }
        let abandoned = self.pending_events();
        if abandoned > 0 {
            self.log_cleanup_failure(format!("{abandoned} pending events abandoned"));
        }

        if let Err(e) = self.core.store.close().await {
            self.log_cleanup_failure(format!("closing store: {e}"));
        }
        info!("Trigger event recorder cleaned up");
    }

    fn log_cleanup_failure(&self, message: String) {
        let error = MetricsError::Cleanup(message);
        error!(code = %ErrorCode::CleanupFailed, error = %error, "Recorder cleanup step failed");
    }

    async fn ensure_initialized(&self) -> Result<(), MetricsError> {
        if self.is_cleaned_up() {
            return Err(MetricsError::shut_down(COMPONENT));
        }
        self.initialized
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn initialize(&self) -> Result<(), MetricsError> {
        self.core
            .breaker
            .call(|| self.core.store.connect())
            .await?;

        if let Some(queue) = &self.core.queue {
            queue.touch();
            let handle = spawn_flush_worker(Arc::clone(&self.core), self.shutdown_tx.subscribe());
            *self.worker.lock() = Some(handle);
        }

        info!(
            mode = ?self.config.mode,
            provider = self.core.store.provider_name(),
            batch_size = self.config.batch_size,
            "Trigger event recorder initialized"
        );
        Ok(())
    }

    fn normalize(&self, event: &mut TriggerEvent) {
        for issue in event.normalize(Utc::now()) {
            warn!(
                trigger_id = %event.trigger_id,
                field = issue.field,
                problem = %issue.problem,
                "Trigger event repaired"
            );
        }
    }

    fn resolve_range(&self, time_range: Option<TimeRange>) -> TimeRange {
        time_range.unwrap_or_else(|| TimeRange::last_hours(self.config.default_query_window_hours))
    }

    async fn read_hash(
        &self,
        key: String,
    ) -> Result<std::collections::HashMap<String, String>, MetricsError> {
        let reply = self.core.read(&[StoreCommand::hgetall(key)]).await?;
        Ok(reply.into_iter().next().unwrap_or_default().into_hash())
    }

    /// Time an operation, count it and wrap its failure with a code
    async fn run<T, Fut>(&self, operation: &'static str, code: ErrorCode, work: Fut) -> OperationResult<T>
    where
        Fut: Future<Output = Result<T, MetricsError>>,
    {
        let started = Instant::now();
        let result = work.await;
        let duration = started.elapsed();

        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.core
            .telemetry
            .record_operation(operation, result.is_ok(), duration);
        log_store_operation(
            COMPONENT,
            operation,
            if result.is_ok() { "ok" } else { "error" },
            duration,
            None,
        );

        result.map_err(|source| {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
            let error = OperationError::new(code, source, self.core.breaker.state(), duration);
            if error.is_circuit_open() {
                debug!(operation = operation, code = %code, "Recorder operation rejected, circuit open");
            } else {
                warn!(
                    operation = operation,
                    code = %code,
                    error = %error.source,
                    circuit_state = %error.circuit_state,
                    "Recorder operation failed"
                );
            }
            error
        })
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, MetricsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(MetricsError::validation(field, "must not be empty"))
    } else {
        Ok(trimmed)
    }
}
