//! # Snapshot collection and rendering
//!
//! [`collect`] reads everything one export needs from the store: it scans the
//! bot-stats and channel-activity namespaces concurrently, then fetches the
//! matching hashes and response-time samples in chunked pipelines.
//! [`render_store_series`] turns the result into metric families in a fresh
//! registry, so series of bots that disappeared from the store disappear from
//! the exposition too. [`SystemMetrics`] holds the exporter's long-lived series.

use crate::error::MetricsError;
use crate::recorder::analytics::parse_sample;
use crate::store::fields::{self, counter};
use crate::store::{keys, scan_all, EventStore, StoreCommand, StoreResult, StoreValue};
use chrono::Utc;
use prometheus::proto::MetricFamily;
use prometheus::{
    Gauge, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::collections::HashMap;
use tracing::warn;

/// Response duration histogram bounds, in seconds
pub const RESPONSE_DURATION_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Commands per pipelined round trip
const PIPELINE_CHUNK: usize = 1_000;

/// Scan and fetch limits for one collection
#[derive(Debug, Clone, Copy)]
pub struct CollectLimits {
    pub scan_count: usize,
    pub max_scan_keys: usize,
    pub sample_window_ms: u64,
    pub sample_limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BotSnapshot {
    pub bot_name: String,
    pub stats: HashMap<String, String>,
    pub conditions: HashMap<String, String>,
    /// Response times in milliseconds
    pub samples: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub activity: HashMap<String, String>,
}

/// Everything read from the store for one export
#[derive(Debug, Clone, Default)]
pub struct CollectedData {
    pub bots: Vec<BotSnapshot>,
    pub channels: Vec<ChannelSnapshot>,
    pub keys_scanned: usize,
    pub truncated: bool,
}

/// Read all bot and channel data an export needs
pub async fn collect(store: &dyn EventStore, limits: CollectLimits) -> StoreResult<CollectedData> {
    let (bot_keys, channel_keys) = futures::future::try_join(
        scan_all(store, keys::BOT_STATS_PATTERN, limits.scan_count, limits.max_scan_keys),
        scan_all(
            store,
            keys::CHANNEL_ACTIVITY_PATTERN,
            limits.scan_count,
            limits.max_scan_keys,
        ),
    )
    .await?;

    let bot_names: Vec<String> = bot_keys
        .keys
        .iter()
        .filter_map(|key| keys::bot_name_from_stats_key(key))
        .map(str::to_string)
        .collect();
    let channel_ids: Vec<String> = channel_keys
        .keys
        .iter()
        .filter_map(|key| keys::channel_id_from_activity_key(key))
        .map(str::to_string)
        .collect();

    let now_ms = Utc::now().timestamp_millis() as f64;
    let window_start = now_ms - limits.sample_window_ms as f64;
    let mut commands = Vec::with_capacity(bot_names.len() * 3 + channel_ids.len());
    for bot_name in &bot_names {
        commands.push(StoreCommand::hgetall(keys::bot_stats(bot_name)));
        commands.push(StoreCommand::hgetall(keys::bot_conditions(bot_name)));
        commands.push(StoreCommand::zrangebyscore(
            keys::bot_performance(bot_name),
            window_start,
            now_ms,
            Some(limits.sample_limit),
        ));
    }
    for channel_id in &channel_ids {
        commands.push(StoreCommand::hgetall(keys::channel_activity(channel_id)));
    }

    let mut replies = Vec::with_capacity(commands.len());
    for chunk in commands.chunks(PIPELINE_CHUNK) {
        let chunk_replies = store.pipeline(chunk).await?;
        for (command, reply) in chunk.iter().zip(chunk_replies) {
            replies.push(reply.unwrap_or_else(|error| {
                warn!(
                    command = command.name(),
                    key = %command.key(),
                    error = %error,
                    "Export read failed, treating as empty"
                );
                StoreValue::Nil
            }));
        }
    }

    let mut replies = replies.into_iter();
    let mut next = move || replies.next().unwrap_or_default();

    let bots = bot_names
        .into_iter()
        .map(|bot_name| BotSnapshot {
            stats: next().into_hash(),
            conditions: next().into_hash(),
            samples: next()
                .into_members()
                .iter()
                .filter_map(|member| parse_sample(member))
                .collect(),
            bot_name,
        })
        .collect();
    let channels = channel_ids
        .into_iter()
        .map(|channel_id| ChannelSnapshot {
            activity: next().into_hash(),
            channel_id,
        })
        .collect();

    Ok(CollectedData {
        bots,
        channels,
        keys_scanned: bot_keys.keys.len() + channel_keys.keys.len(),
        truncated: bot_keys.truncated || channel_keys.truncated,
    })
}

/// Build the store-derived series in a fresh registry
pub fn render_store_series(
    namespace: &str,
    data: &CollectedData,
) -> Result<Vec<MetricFamily>, MetricsError> {
    let registry = Registry::new();
    let name = |suffix: &str| format!("{namespace}_{suffix}");

    let triggers = IntCounterVec::new(
        Opts::new(name("bot_triggers_total"), "Total trigger events per bot"),
        &["bot_name"],
    )?;
    let condition_triggers = IntCounterVec::new(
        Opts::new(
            name("bot_condition_triggers_total"),
            "Trigger events per bot and condition",
        ),
        &["bot_name", "condition_name"],
    )?;
    let responses = IntCounterVec::new(
        Opts::new(name("bot_responses_total"), "Successful responses per bot"),
        &["bot_name"],
    )?;
    let failures = IntCounterVec::new(
        Opts::new(name("bot_failures_total"), "Failed responses per bot"),
        &["bot_name"],
    )?;
    let durations = HistogramVec::new(
        HistogramOpts::new(
            name("bot_response_duration_seconds"),
            "Bot response time over the recent sample window",
        )
        .buckets(RESPONSE_DURATION_BUCKETS.to_vec()),
        &["bot_name"],
    )?;
    let unique_users = IntGaugeVec::new(
        Opts::new(name("bot_unique_users"), "Distinct users that triggered the bot"),
        &["bot_name"],
    )?;
    let unique_channels = IntGaugeVec::new(
        Opts::new(name("bot_unique_channels"), "Distinct channels the bot was triggered in"),
        &["bot_name"],
    )?;
    let channel_activity = IntGaugeVec::new(
        Opts::new(name("channel_activity"), "Bot triggers per channel"),
        &["channel_id", "guild_id"],
    )?;

    registry.register(Box::new(triggers.clone()))?;
    registry.register(Box::new(condition_triggers.clone()))?;
    registry.register(Box::new(responses.clone()))?;
    registry.register(Box::new(failures.clone()))?;
    registry.register(Box::new(durations.clone()))?;
    registry.register(Box::new(unique_users.clone()))?;
    registry.register(Box::new(unique_channels.clone()))?;
    registry.register(Box::new(channel_activity.clone()))?;

    for bot in &data.bots {
        let key = keys::bot_stats(&bot.bot_name);
        let labels = [bot.bot_name.as_str()];
        triggers
            .with_label_values(&labels)
            .inc_by(counter(&bot.stats, fields::TOTAL_TRIGGERS, &key));
        responses
            .with_label_values(&labels)
            .inc_by(counter(&bot.stats, fields::TOTAL_RESPONSES, &key));
        failures
            .with_label_values(&labels)
            .inc_by(counter(&bot.stats, fields::TOTAL_FAILURES, &key));
        unique_users
            .with_label_values(&labels)
            .set(gauge_value(counter(&bot.stats, fields::UNIQUE_USERS, &key)));
        unique_channels
            .with_label_values(&labels)
            .set(gauge_value(counter(&bot.stats, fields::UNIQUE_CHANNELS, &key)));

        let conditions_key = keys::bot_conditions(&bot.bot_name);
        for (condition, raw) in &bot.conditions {
            condition_triggers
                .with_label_values(&[bot.bot_name.as_str(), condition.as_str()])
                .inc_by(fields::parse_counter_value(raw, condition, &conditions_key));
        }

        let histogram = durations.with_label_values(&labels);
        for sample in &bot.samples {
            histogram.observe(*sample as f64 / 1000.0);
        }
    }

    for channel in &data.channels {
        let key = keys::channel_activity(&channel.channel_id);
        let guild_id = channel
            .activity
            .get(fields::GUILD_ID)
            .map(String::as_str)
            .unwrap_or("");
        channel_activity
            .with_label_values(&[channel.channel_id.as_str(), guild_id])
            .set(gauge_value(counter(&channel.activity, fields::BOT_TRIGGERS, &key)));
    }

    Ok(registry.gather())
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Exposition returned before any snapshot could be built
pub fn unavailable_marker(namespace: &str) -> String {
    format!(
        "# HELP {namespace}_exporter_up Whether the exporter could read the event store\n\
         # TYPE {namespace}_exporter_up gauge\n\
         {namespace}_exporter_up 0\n"
    )
}

/// Long-lived exporter series, replaced wholesale by a reset
#[derive(Clone)]
pub struct SystemMetrics {
    registry: Registry,
    pub store_connection_status: IntGauge,
    pub store_keys_scanned: IntGauge,
    pub export_duration: Histogram,
    pub cache_hit_rate: Gauge,
    pub cache_requests: IntCounterVec,
    pub circuit_breaker_state: IntGauge,
    pub exports: IntCounterVec,
    pub exporter_up: IntGauge,
    /// Present only when a recorder is attached
    pub recorder: Option<RecorderSeries>,
}

#[derive(Clone)]
pub struct RecorderSeries {
    pub pending_events: IntGauge,
    pub circuit_breaker_state: IntGauge,
}

impl std::fmt::Debug for SystemMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMetrics")
            .field("with_recorder", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

impl SystemMetrics {
    pub fn new(namespace: &str, with_recorder: bool) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let name = |suffix: &str| format!("{namespace}_{suffix}");

        let store_connection_status = IntGauge::new(
            name("store_connection_status"),
            "Event store connection status (1 = connected)",
        )?;
        let store_keys_scanned = IntGauge::new(
            name("store_keys_scanned"),
            "Keys collected by the last export scan",
        )?;
        let export_duration = Histogram::with_opts(HistogramOpts::new(
            name("export_duration_seconds"),
            "Time spent collecting a snapshot from the store",
        ))?;
        let cache_hit_rate = Gauge::new(name("cache_hit_rate"), "Fraction of exports served from cache")?;
        let cache_requests = IntCounterVec::new(
            Opts::new(name("cache_requests_total"), "Snapshot cache lookups"),
            &["result"],
        )?;
        let circuit_breaker_state = IntGauge::new(
            name("exporter_circuit_breaker_state"),
            "Exporter circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
        )?;
        let exports = IntCounterVec::new(
            Opts::new(name("exports_total"), "Snapshot builds by outcome"),
            &["outcome"],
        )?;
        let exporter_up = IntGauge::new(
            name("exporter_up"),
            "Whether the exporter could read the event store",
        )?;

        registry.register(Box::new(store_connection_status.clone()))?;
        registry.register(Box::new(store_keys_scanned.clone()))?;
        registry.register(Box::new(export_duration.clone()))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;
        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(exports.clone()))?;
        registry.register(Box::new(exporter_up.clone()))?;

        let recorder = if with_recorder {
            let pending_events = IntGauge::new(
                name("recorder_pending_events"),
                "Events queued in the recorder",
            )?;
            let circuit_breaker_state = IntGauge::new(
                name("recorder_circuit_breaker_state"),
                "Recorder circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
            )?;
            registry.register(Box::new(pending_events.clone()))?;
            registry.register(Box::new(circuit_breaker_state.clone()))?;
            Some(RecorderSeries {
                pending_events,
                circuit_breaker_state,
            })
        } else {
            None
        };

        Ok(Self {
            registry,
            store_connection_status,
            store_keys_scanned,
            export_duration,
            cache_hit_rate,
            cache_requests,
            circuit_breaker_state,
            exports,
            exporter_up,
            recorder,
        })
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn encode(families: &[MetricFamily]) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_store_series_from_collected_data() {
        let data = CollectedData {
            bots: vec![BotSnapshot {
                bot_name: "EzioBot".to_string(),
                stats: hash(&[
                    ("total_triggers", "5"),
                    ("total_responses", "4"),
                    ("total_failures", "oops"),
                    ("unique_users", "2"),
                ]),
                conditions: hash(&[("assassin", "5")]),
                samples: vec![100, 100, 2000],
            }],
            channels: vec![ChannelSnapshot {
                channel_id: "c1".to_string(),
                activity: hash(&[("bot_triggers", "5"), ("guild_id", "g1")]),
            }],
            keys_scanned: 2,
            truncated: false,
        };

        let text = encode(&render_store_series("tm", &data).unwrap());
        assert!(text.contains("tm_bot_triggers_total{bot_name=\"EzioBot\"} 5"));
        assert!(text.contains("tm_bot_failures_total{bot_name=\"EzioBot\"} 0"));
        assert!(text.contains(
            "tm_bot_condition_triggers_total{bot_name=\"EzioBot\",condition_name=\"assassin\"} 5"
        ));
        assert!(text.contains("tm_bot_response_duration_seconds_bucket{bot_name=\"EzioBot\",le=\"0.1\"} 2"));
        assert!(text.contains("tm_bot_response_duration_seconds_count{bot_name=\"EzioBot\"} 3"));
        assert!(text.contains("tm_channel_activity{channel_id=\"c1\",guild_id=\"g1\"} 5"));
    }

    #[test]
    fn test_unavailable_marker_is_valid_exposition() {
        let marker = unavailable_marker("tm");
        assert!(marker.contains("# TYPE tm_exporter_up gauge"));
        assert!(marker.ends_with("tm_exporter_up 0\n"));
    }

    #[test]
    fn test_recorder_series_only_when_attached() {
        let without = encode(&SystemMetrics::new("tm", false).unwrap().gather());
        assert!(!without.contains("tm_recorder_pending_events"));

        let system = SystemMetrics::new("tm", true).unwrap();
        system.recorder.as_ref().unwrap().pending_events.set(4);
        let with = encode(&system.gather());
        assert!(with.contains("tm_recorder_pending_events 4"));
    }
}
