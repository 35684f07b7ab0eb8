//! # Metrics Exporter
//!
//! Independent read path over the shared event store. An export scans the
//! bot and channel namespaces, aggregates them into exposition text and caches
//! the result for `cache_ttl_ms`. The exporter owns its own [`CircuitBreaker`],
//! so a failing write path never disables scrapes and the other way round.
//!
//! A scrape never fails: on any store error the previous snapshot is served,
//! or [`snapshot::unavailable_marker`] when there is none yet.

pub mod cache;
pub mod snapshot;

pub use cache::{CacheStats, SnapshotCache, SNAPSHOT_KEY};
pub use snapshot::{CollectLimits, CollectedData, SystemMetrics};

use crate::config::ExporterConfig;
use crate::error::MetricsError;
use crate::logging::log_store_operation;
use crate::recorder::TriggerEventRecorder;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Content type of the exposition text
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const COMPONENT: &str = "metrics_exporter";

/// Introspection counters returned by [`MetricsExporter::stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterStats {
    pub initialized: bool,
    pub shut_down: bool,
    pub store_connected: bool,
    pub recorder_attached: bool,
    pub cache: CacheStats,
    pub exports: u64,
    pub failed_exports: u64,
    /// Calls answered without scanning because another export was running
    pub skipped_exports: u64,
    pub last_export_duration_ms: u64,
    pub last_keys_scanned: u64,
    pub last_export_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
}

#[derive(Debug)]
struct Binding {
    store: Arc<dyn EventStore>,
    recorder: Option<Arc<TriggerEventRecorder>>,
}

/// Clears the in-progress flag when an export ends, including by cancellation
struct ExportGuard<'a>(&'a AtomicBool);

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ExportCounters {
    exports: AtomicU64,
    failed_exports: AtomicU64,
    skipped_exports: AtomicU64,
    last_export_duration_ms: AtomicU64,
    last_keys_scanned: AtomicU64,
    last_export_millis: AtomicU64,
}

impl ExportCounters {
    fn reset(&self) {
        self.exports.store(0, Ordering::Relaxed);
        self.failed_exports.store(0, Ordering::Relaxed);
        self.skipped_exports.store(0, Ordering::Relaxed);
        self.last_export_duration_ms.store(0, Ordering::Relaxed);
        self.last_keys_scanned.store(0, Ordering::Relaxed);
        self.last_export_millis.store(0, Ordering::Relaxed);
    }
}

/// Cached exposition snapshot builder
#[derive(Debug)]
pub struct MetricsExporter {
    config: ExporterConfig,
    breaker: CircuitBreaker,
    binding: RwLock<Option<Binding>>,
    cache: Arc<SnapshotCache>,
    system: RwLock<Arc<SystemMetrics>>,
    export_in_progress: AtomicBool,
    store_connected: AtomicBool,
    shut_down: AtomicBool,
    counters: ExportCounters,
    shutdown_tx: broadcast::Sender<()>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsExporter {
    pub fn new(config: ExporterConfig) -> Result<Self, MetricsError> {
        let breaker = CircuitBreaker::try_new(
            COMPONENT.to_string(),
            config.circuit_breaker.to_resilience_config(),
        )
        .map_err(|e| MetricsError::Configuration(e.to_string()))?;
        let system = SystemMetrics::new(&config.namespace, false)?;
        let cache = SnapshotCache::new(config.cache_ttl(), config.cache_retention());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            breaker,
            binding: RwLock::new(None),
            cache: Arc::new(cache),
            system: RwLock::new(Arc::new(system)),
            export_in_progress: AtomicBool::new(false),
            store_connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            counters: ExportCounters::default(),
            shutdown_tx,
            sweep_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.binding.read().is_some()
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    /// Bind the store and an optional recorder, then start the cache sweep.
    /// A failed ping marks the store disconnected but does not fail; a second
    /// call is a no-op.
    pub async fn initialize(
        &self,
        store: Arc<dyn EventStore>,
        recorder: Option<Arc<TriggerEventRecorder>>,
    ) -> Result<(), MetricsError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MetricsError::shut_down(COMPONENT));
        }
        if self.is_initialized() {
            debug!("Metrics exporter already initialized");
            return Ok(());
        }

        if recorder.is_some() {
            let system = SystemMetrics::new(&self.config.namespace, true)?;
            *self.system.write() = Arc::new(system);
        }

        let connected = match Self::probe(store.as_ref()).await {
            Ok(latency) => {
                debug!(latency_ms = latency.as_millis() as u64, "Exporter store ping succeeded");
                true
            }
            Err(error) => {
                warn!(error = %error, "Exporter store ping failed, starting disconnected");
                false
            }
        };
        self.set_store_connected(connected);

        let provider = store.provider_name();
        let recorder_attached = recorder.is_some();
        {
            let mut binding = self.binding.write();
            if binding.is_some() {
                return Ok(());
            }
            *binding = Some(Binding { store, recorder });
        }
        self.start_cache_sweep();

        info!(
            provider = provider,
            store_connected = connected,
            recorder_attached = recorder_attached,
            cache_ttl_ms = self.config.cache_ttl_ms,
            "Metrics exporter initialized"
        );
        Ok(())
    }

    async fn probe(store: &dyn EventStore) -> Result<std::time::Duration, StoreError> {
        if !store.is_connected() {
            store.connect().await?;
        }
        store.ping().await
    }

    /// Exposition text for a scrape. Never fails.
    pub async fn export_metrics(&self) -> String {
        if self.shut_down.load(Ordering::Acquire) {
            return snapshot::unavailable_marker(&self.config.namespace);
        }
        let Some((store, recorder)) = self.bound() else {
            debug!("Export requested before initialization");
            return snapshot::unavailable_marker(&self.config.namespace);
        };

        if self
            .export_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.skipped_exports.fetch_add(1, Ordering::Relaxed);
            debug!("Export already in progress, serving last snapshot");
            return self.last_known_good();
        }
        let _guard = ExportGuard(&self.export_in_progress);

        let system = self.system();
        if let Some(text) = self.cache.get_fresh(SNAPSHOT_KEY) {
            system.cache_requests.with_label_values(&["hit"]).inc();
            system.cache_hit_rate.set(self.cache.hit_rate());
            return text;
        }
        system.cache_requests.with_label_values(&["miss"]).inc();

        let started = Instant::now();
        let limits = CollectLimits {
            scan_count: self.config.scan_count,
            max_scan_keys: self.config.max_scan_keys,
            sample_window_ms: self.config.histogram_sample_window_ms,
            sample_limit: self.config.histogram_sample_limit,
        };
        let timeout = self.config.export_timeout();
        let collected = self
            .breaker
            .call(|| async {
                match tokio::time::timeout(timeout, snapshot::collect(store.as_ref(), limits)).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::timeout("export", self.config.export_timeout_ms)),
                }
            })
            .await
            .map_err(MetricsError::from);
        let duration = started.elapsed();

        let rendered = collected.and_then(|data| {
            self.record_collection(&system, &data, duration, recorder.as_deref());
            self.render(&system, &data)
        });

        match rendered {
            Ok(text) => {
                self.cache.insert(SNAPSHOT_KEY, text.clone());
                self.counters.exports.fetch_add(1, Ordering::Relaxed);
                log_store_operation(COMPONENT, "export", "ok", duration, None);
                debug!(bytes = text.len(), "Snapshot rebuilt");
                text
            }
            Err(error) => {
                self.counters.failed_exports.fetch_add(1, Ordering::Relaxed);
                system.exports.with_label_values(&["failure"]).inc();
                system
                    .circuit_breaker_state
                    .set(self.breaker.state().as_gauge_value());
                if let MetricsError::Store(store_error) = &error {
                    if store_error.is_connectivity() {
                        self.set_store_connected(false);
                    }
                }
                if error.is_circuit_open() {
                    debug!("Export skipped, circuit open");
                } else {
                    warn!(
                        error = %error,
                        circuit_state = %self.breaker.state(),
                        "Export failed, serving last snapshot"
                    );
                }
                self.last_known_good()
            }
        }
    }

    /// Alias of [`export_metrics`](Self::export_metrics) for the scrape endpoint
    pub async fn prometheus_metrics(&self) -> String {
        self.export_metrics().await
    }

    pub fn stats(&self) -> ExporterStats {
        let last_export_millis = self.counters.last_export_millis.load(Ordering::Relaxed);
        let binding = self.binding.read();
        ExporterStats {
            initialized: binding.is_some(),
            shut_down: self.shut_down.load(Ordering::Acquire),
            store_connected: self.store_connected.load(Ordering::Acquire),
            recorder_attached: binding.as_ref().is_some_and(|b| b.recorder.is_some()),
            cache: self.cache.stats(),
            exports: self.counters.exports.load(Ordering::Relaxed),
            failed_exports: self.counters.failed_exports.load(Ordering::Relaxed),
            skipped_exports: self.counters.skipped_exports.load(Ordering::Relaxed),
            last_export_duration_ms: self.counters.last_export_duration_ms.load(Ordering::Relaxed),
            last_keys_scanned: self.counters.last_keys_scanned.load(Ordering::Relaxed),
            last_export_at: (last_export_millis > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_export_millis as i64))
                .flatten(),
            circuit_state: self.breaker.state(),
        }
    }

    /// Clear the cache, every counter and the system series
    pub fn reset(&self) -> Result<(), MetricsError> {
        let with_recorder = self
            .binding
            .read()
            .as_ref()
            .is_some_and(|b| b.recorder.is_some());
        let system = SystemMetrics::new(&self.config.namespace, with_recorder)?;
        system
            .store_connection_status
            .set(i64::from(self.store_connected.load(Ordering::Acquire)));
        *self.system.write() = Arc::new(system);
        self.cache.clear();
        self.cache.reset_counters();
        self.counters.reset();
        self.breaker.reset();
        info!("Metrics exporter reset");
        Ok(())
    }

    /// Stop the sweep task and clear the cache. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let task = self.sweep_task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweep task ended abnormally");
            }
        }
        self.cache.clear();
        info!("Metrics exporter shut down");
    }

    fn bound(&self) -> Option<(Arc<dyn EventStore>, Option<Arc<TriggerEventRecorder>>)> {
        self.binding
            .read()
            .as_ref()
            .map(|b| (Arc::clone(&b.store), b.recorder.clone()))
    }

    fn system(&self) -> Arc<SystemMetrics> {
        Arc::clone(&self.system.read())
    }

    fn set_store_connected(&self, connected: bool) {
        self.store_connected.store(connected, Ordering::Release);
        self.system()
            .store_connection_status
            .set(i64::from(connected));
    }

    fn last_known_good(&self) -> String {
        self.cache
            .latest(SNAPSHOT_KEY)
            .map(|entry| entry.text)
            .unwrap_or_else(|| snapshot::unavailable_marker(&self.config.namespace))
    }

    fn record_collection(
        &self,
        system: &SystemMetrics,
        data: &CollectedData,
        duration: std::time::Duration,
        recorder: Option<&TriggerEventRecorder>,
    ) {
        self.set_store_connected(true);
        self.counters
            .last_export_duration_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
        self.counters
            .last_keys_scanned
            .store(data.keys_scanned as u64, Ordering::Relaxed);
        self.counters
            .last_export_millis
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);

        system.store_keys_scanned.set(data.keys_scanned as i64);
        system.export_duration.observe(duration.as_secs_f64());
        system.cache_hit_rate.set(self.cache.hit_rate());
        system
            .circuit_breaker_state
            .set(self.breaker.state().as_gauge_value());
        system.exports.with_label_values(&["success"]).inc();
        system.exporter_up.set(1);

        if let (Some(series), Some(recorder)) = (&system.recorder, recorder) {
            series.pending_events.set(recorder.pending_events() as i64);
            series
                .circuit_breaker_state
                .set(recorder.circuit_state().as_gauge_value());
        }
    }

    fn render(&self, system: &SystemMetrics, data: &CollectedData) -> Result<String, MetricsError> {
        let mut families = snapshot::render_store_series(&self.config.namespace, data)?;
        families.extend(system.gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Export(e.to_string()))
    }

    fn start_cache_sweep(&self) {
        let mut task = self.sweep_task.lock();
        if task.is_some() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let interval = self.config.cache_sweep_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            debug!(evicted = evicted, "Evicted expired snapshots");
                        }
                    }
                }
            }
        }));
    }
}
