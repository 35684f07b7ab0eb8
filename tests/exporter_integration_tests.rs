//! Exporter snapshots, caching and isolation from the write path

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use trigger_metrics::config::{ExporterConfig, RecorderConfig};
use trigger_metrics::exporter::{MetricsExporter, CONTENT_TYPE};
use trigger_metrics::resilience::CircuitState;
use trigger_metrics::store::EventStore;

const MARKER_LINE: &str = "trigger_metrics_exporter_up 0";

#[tokio::test]
async fn test_export_reflects_recorded_triggers() {
    let (store, recorder) = recorder(RecorderConfig::direct());
    for _ in 0..5 {
        recorder
            .track_bot_trigger(
                event("EzioBot")
                    .condition("assassin")
                    .channel("c1")
                    .guild("g1")
                    .response_time(40)
                    .build(),
            )
            .await
            .unwrap();
    }

    let exporter = MetricsExporter::new(ExporterConfig::default()).unwrap();
    exporter.initialize(store.clone(), Some(recorder.clone())).await.unwrap();
    let text = exporter.prometheus_metrics().await;

    assert!(text.contains("trigger_metrics_bot_triggers_total{bot_name=\"EzioBot\"} 5"));
    assert!(text.contains(
        "trigger_metrics_bot_condition_triggers_total{bot_name=\"EzioBot\",condition_name=\"assassin\"} 5"
    ));
    assert!(text.contains("trigger_metrics_bot_failures_total{bot_name=\"EzioBot\"} 0"));
    assert!(text.contains("trigger_metrics_bot_response_duration_seconds_count{bot_name=\"EzioBot\"} 5"));
    assert!(text.contains("trigger_metrics_channel_activity{channel_id=\"c1\",guild_id=\"g1\"} 5"));
    assert!(text.contains("trigger_metrics_store_connection_status 1"));
    assert!(text.contains("trigger_metrics_recorder_pending_events 0"));
    assert!(text.contains("trigger_metrics_recorder_circuit_breaker_state 0"));
    assert!(text.contains("trigger_metrics_exporter_up 1"));
    assert_eq!(exporter.content_type(), CONTENT_TYPE);

    let stats = exporter.stats();
    assert!(stats.recorder_attached);
    assert_eq!(stats.last_keys_scanned, 2);
    assert!(stats.last_export_at.is_some());
    exporter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_is_rebuilt_after_ttl() {
    let (store, recorder) = recorder(RecorderConfig::direct());
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();

    let exporter = MetricsExporter::new(exporter_config(1_000)).unwrap();
    exporter.initialize(store.clone(), None).await.unwrap();

    let first = exporter.export_metrics().await;
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();
    let scans_after_first = store.stats().scans;

    // Within the TTL the cached text is served
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(exporter.export_metrics().await, first);
    assert_eq!(store.stats().scans, scans_after_first);

    tokio::time::advance(Duration::from_millis(600)).await;
    let second = exporter.export_metrics().await;
    assert!(second.contains("trigger_metrics_bot_triggers_total{bot_name=\"EzioBot\"} 2"));
    assert!(store.stats().scans > scans_after_first);

    let stats = exporter.stats();
    assert_eq!(stats.exports, 2);
    assert_eq!(stats.cache.hits, 1);
    exporter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_export_is_skipped() {
    let (memory, recorder) = recorder(RecorderConfig::direct());
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();

    let slow: Arc<dyn EventStore> = Arc::new(SlowStore::new(memory, Duration::from_millis(50)));
    let exporter = Arc::new(MetricsExporter::new(ExporterConfig::default()).unwrap());
    exporter.initialize(slow, None).await.unwrap();

    let running = {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move { exporter.export_metrics().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // No snapshot exists yet, so the skipped call gets the marker
    let skipped = exporter.export_metrics().await;
    assert!(skipped.contains(MARKER_LINE));

    let built = running.await.unwrap();
    assert!(built.contains("trigger_metrics_bot_triggers_total{bot_name=\"EzioBot\"} 1"));

    let stats = exporter.stats();
    assert_eq!(stats.skipped_exports, 1);
    assert_eq!(stats.exports, 1);
    exporter.shutdown().await;
}

#[tokio::test]
async fn test_export_before_initialize_returns_marker() {
    let exporter = MetricsExporter::new(ExporterConfig::default()).unwrap();
    let text = exporter.export_metrics().await;
    assert!(text.contains("# TYPE trigger_metrics_exporter_up gauge"));
    assert!(text.contains(MARKER_LINE));
    assert!(!exporter.stats().initialized);
}

#[tokio::test]
async fn test_exporter_breaker_is_independent_of_recorder() {
    let (store, recorder) = recorder(RecorderConfig::direct());
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();

    let exporter = MetricsExporter::new(exporter_config(1)).unwrap();
    store.set_available(false);
    exporter.initialize(store.clone(), Some(recorder.clone())).await.unwrap();

    for _ in 0..3 {
        assert!(exporter.export_metrics().await.contains(MARKER_LINE));
    }
    assert_eq!(exporter.circuit_state(), CircuitState::Open);
    assert_eq!(recorder.circuit_state(), CircuitState::Closed);
    assert_eq!(exporter.stats().failed_exports, 3);

    // Open exporter circuit rejects without scanning
    let scans = store.stats().scans;
    store.set_available(true);
    assert!(exporter.export_metrics().await.contains(MARKER_LINE));
    assert_eq!(store.stats().scans, scans);

    // The write path keeps working
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();

    exporter.reset().unwrap();
    assert_eq!(exporter.circuit_state(), CircuitState::Closed);
    let text = exporter.export_metrics().await;
    assert!(text.contains("trigger_metrics_bot_triggers_total{bot_name=\"EzioBot\"} 2"));
    exporter.shutdown().await;
}

#[tokio::test]
async fn test_recorder_breaker_open_does_not_block_export() {
    let (store, recorder) = recorder(RecorderConfig::direct());
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();
    recorder.circuit_breaker().force_open();

    let exporter = MetricsExporter::new(ExporterConfig::default()).unwrap();
    exporter.initialize(store, Some(recorder.clone())).await.unwrap();
    let text = exporter.export_metrics().await;

    assert!(text.contains("trigger_metrics_exporter_up 1"));
    assert!(text.contains("trigger_metrics_recorder_circuit_breaker_state 1"));
    exporter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweep_evicts_stale_snapshots() {
    let (store, recorder) = recorder(RecorderConfig::direct());
    recorder.track_bot_trigger(event("EzioBot").build()).await.unwrap();

    let config = ExporterConfig {
        cache_ttl_ms: 1_000,
        cache_retention_ms: 2_000,
        cache_sweep_interval_ms: 500,
        ..ExporterConfig::default()
    };
    let exporter = MetricsExporter::new(config).unwrap();
    exporter.initialize(store, None).await.unwrap();
    exporter.export_metrics().await;
    assert_eq!(exporter.stats().cache.entries, 1);

    tokio::time::sleep(Duration::from_millis(2_600)).await;
    let stats = exporter.stats();
    assert_eq!(stats.cache.entries, 0);
    assert_eq!(stats.cache.evictions, 1);
    exporter.shutdown().await;
}
