//! # Health Monitoring
//!
//! [`HealthMonitor`] combines store connectivity with the recorder's and the
//! exporter's breaker states into one [`HealthReport`]. Checks run on demand
//! via [`HealthMonitor::check`] or on an owned background task started with
//! [`HealthMonitor::start`].

use crate::config::HealthConfig;
use crate::exporter::MetricsExporter;
use crate::recorder::TriggerEventRecorder;
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error rate below which a component counts as healthy
pub const HEALTHY_ERROR_RATE: f64 = 0.1;
/// Error rate below which a component counts as degraded rather than unhealthy
pub const DEGRADED_ERROR_RATE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Status of a component from its connectivity, breaker and error rate
    pub fn classify(store_connected: bool, circuit_state: CircuitState, error_rate: f64) -> Self {
        if store_connected && circuit_state == CircuitState::Closed && error_rate < HEALTHY_ERROR_RATE {
            HealthStatus::Healthy
        } else if store_connected
            && circuit_state != CircuitState::Open
            && error_rate < DEGRADED_ERROR_RATE
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// The worse of two statuses
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub provider: String,
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Breaker view of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub component: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
}

impl BreakerHealth {
    fn from_breaker(breaker: &CircuitBreaker) -> Self {
        Self {
            component: breaker.name().to_string(),
            state: breaker.state(),
            failure_count: breaker.failure_count(),
            failure_threshold: breaker.config().failure_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub store: StoreHealth,
    pub breakers: Vec<BreakerHealth>,
    /// Events queued in the recorder, if one is attached
    pub pending_events: Option<usize>,
}

impl HealthReport {
    pub fn breaker(&self, component: &str) -> Option<&BreakerHealth> {
        self.breakers.iter().find(|b| b.component == component)
    }
}

/// Composes store connectivity and breaker states into one status
#[derive(Debug)]
pub struct HealthMonitor {
    store: Arc<dyn EventStore>,
    config: HealthConfig,
    recorder: Option<Arc<TriggerEventRecorder>>,
    exporter: Option<Arc<MetricsExporter>>,
    last_report: RwLock<Option<HealthReport>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn EventStore>, config: HealthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            config,
            recorder: None,
            exporter: None,
            last_report: RwLock::new(None),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<TriggerEventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Ping the store, raced against the check timeout, and read breaker states
    pub async fn check(&self) -> HealthReport {
        let timeout = self.config.check_timeout();
        let store = match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(Ok(latency)) => StoreHealth {
                provider: self.store.provider_name().to_string(),
                connected: true,
                latency_ms: Some(latency.as_millis() as u64),
                error: None,
            },
            Ok(Err(error)) => StoreHealth {
                provider: self.store.provider_name().to_string(),
                connected: false,
                latency_ms: None,
                error: Some(error.to_string()),
            },
            Err(_) => StoreHealth {
                provider: self.store.provider_name().to_string(),
                connected: false,
                latency_ms: None,
                error: Some(format!("ping timed out after {}ms", timeout.as_millis())),
            },
        };

        let mut breakers = Vec::new();
        if let Some(recorder) = &self.recorder {
            breakers.push(BreakerHealth::from_breaker(recorder.circuit_breaker()));
        }
        if let Some(exporter) = &self.exporter {
            breakers.push(BreakerHealth::from_breaker(exporter.circuit_breaker()));
        }

        let status = breakers.iter().fold(
            if store.connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            |status, breaker| {
                let breaker_status = match breaker.state {
                    CircuitState::Closed => HealthStatus::Healthy,
                    CircuitState::HalfOpen | CircuitState::Open => HealthStatus::Degraded,
                };
                status.worst(breaker_status)
            },
        );

        let report = HealthReport {
            status,
            checked_at: Utc::now(),
            store,
            breakers,
            pending_events: self.recorder.as_ref().map(|r| r.pending_events()),
        };
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Most recent report from either an on-demand or a periodic check
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start periodic checks; a second call while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Health monitor loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = monitor.check().await;
                        if report.status.is_healthy() {
                            debug!(latency_ms = ?report.store.latency_ms, "Health check passed");
                        } else {
                            warn!(
                                status = %report.status,
                                store_connected = report.store.connected,
                                store_error = ?report.store.error,
                                open_breakers = ?report
                                    .breakers
                                    .iter()
                                    .filter(|b| b.state != CircuitState::Closed)
                                    .map(|b| b.component.as_str())
                                    .collect::<Vec<_>>(),
                                "Health check not healthy"
                            );
                        }
                    }
                }
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
    }

    /// Stop periodic checks and wait for the task to finish
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
            info!("Health monitor stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::events::TriggerEvent;
    use crate::store::MemoryEventStore;
    use std::time::Duration;

    #[test]
    fn test_classify_thresholds() {
        use CircuitState::*;
        assert_eq!(HealthStatus::classify(true, Closed, 0.05), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(true, Closed, 0.2), HealthStatus::Degraded);
        assert_eq!(HealthStatus::classify(true, HalfOpen, 0.0), HealthStatus::Degraded);
        assert_eq!(HealthStatus::classify(true, Open, 0.0), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::classify(true, Closed, 0.3), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::classify(false, Closed, 0.0), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_check_composes_store_and_breakers() {
        let store = Arc::new(MemoryEventStore::new());
        let recorder = Arc::new(
            TriggerEventRecorder::new(store.clone(), RecorderConfig::direct()).unwrap(),
        );
        let monitor = HealthMonitor::new(store.clone(), HealthConfig::default())
            .with_recorder(recorder.clone());

        // Not yet connected
        assert_eq!(monitor.check().await.status, HealthStatus::Unhealthy);

        recorder
            .track_bot_trigger(TriggerEvent::new("EzioBot", "assassin", "u1", "c1", "m1"))
            .await
            .unwrap();
        let report = monitor.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.breaker("trigger_recorder").unwrap().state, CircuitState::Closed);

        recorder.circuit_breaker().force_open();
        assert_eq!(monitor.check().await.status, HealthStatus::Degraded);
        assert!(monitor.last_report().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checks_stop_deterministically() {
        let store = Arc::new(MemoryEventStore::new());
        store.connect().await.unwrap();
        let config = HealthConfig {
            interval_ms: 100,
            ..HealthConfig::default()
        };
        let monitor = Arc::new(HealthMonitor::new(store, config));

        monitor.start();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(monitor.is_running());
        assert!(monitor.last_report().is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
