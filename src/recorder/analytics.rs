//! # Query results
//!
//! Result types of the recorder's query surface and the pure functions that
//! build them from raw store replies. Parsing is defensive throughout: a missing
//! or malformed field reads as zero and never fails a query.

use crate::events::{AggregationPeriod, TimeRange};
use crate::store::fields::{self, counter, optional_counter, prefixed_counts, rank_by_count};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Distribution of response-time samples, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeStats {
    pub sample_count: usize,
    pub average_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl ResponseTimeStats {
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();

        let median_ms = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) as f64 / 2.0
        } else {
            sorted[count / 2] as f64
        };

        Self {
            sample_count: count,
            average_ms: sum as f64 / count as f64,
            median_ms,
            p95_ms: nearest_rank(&sorted, 0.95) as f64,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
        }
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice
fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Response time of a performance sample member (`<ms>:<trigger id>`)
pub fn parse_sample(member: &str) -> Option<u64> {
    member.split_once(':')?.0.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionCount {
    pub condition_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyTrendPoint {
    /// Hour bucket key, `YYYY-MM-DDTHH`
    pub hour: String,
    pub triggers: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
}

/// Analytics for one bot
///
/// Totals and unique counts are lifetime counters; percentiles, trends and
/// window totals are scoped to `time_range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotAnalytics {
    pub bot_name: String,
    pub time_range: TimeRange,
    pub total_triggers: u64,
    pub total_responses: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub unique_users: u64,
    pub unique_channels: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub response_times: ResponseTimeStats,
    pub top_conditions: Vec<ConditionCount>,
    pub hourly_trends: Vec<HourlyTrendPoint>,
}

/// Raw replies a [`BotAnalytics`] is computed from
#[derive(Debug, Default)]
pub struct BotReadings {
    pub stats: HashMap<String, String>,
    pub conditions: HashMap<String, String>,
    pub performance_members: Vec<String>,
    /// (hour key, bucket hash), oldest first
    pub hourly: Vec<(String, HashMap<String, String>)>,
}

pub fn bot_analytics(
    bot_name: &str,
    time_range: TimeRange,
    readings: BotReadings,
    top_conditions_limit: usize,
) -> BotAnalytics {
    let stats_key = crate::store::keys::bot_stats(bot_name);
    let stats = &readings.stats;
    let total_triggers = counter(stats, fields::TOTAL_TRIGGERS, &stats_key);
    let total_responses = counter(stats, fields::TOTAL_RESPONSES, &stats_key);
    let total_failures = counter(stats, fields::TOTAL_FAILURES, &stats_key);
    let total_response_time = counter(stats, fields::TOTAL_RESPONSE_TIME, &stats_key);

    let samples: Vec<u64> = readings
        .performance_members
        .iter()
        .filter_map(|member| parse_sample(member))
        .collect();
    let mut response_times = ResponseTimeStats::from_samples(&samples);
    if response_times.sample_count == 0 {
        response_times.min_ms = optional_counter(stats, fields::MIN_RESPONSE_TIME, &stats_key).unwrap_or(0);
        response_times.max_ms = optional_counter(stats, fields::MAX_RESPONSE_TIME, &stats_key).unwrap_or(0);
    }

    let conditions_key = crate::store::keys::bot_conditions(bot_name);
    let condition_counts = readings
        .conditions
        .iter()
        .map(|(name, raw)| {
            (
                name.clone(),
                fields::parse_counter_value(raw, name, &conditions_key),
            )
        })
        .collect();
    let top_conditions = rank_by_count(condition_counts, top_conditions_limit)
        .into_iter()
        .map(|(condition_name, count)| ConditionCount {
            condition_name,
            count,
        })
        .collect();

    let hourly_trends = readings
        .hourly
        .iter()
        .filter_map(|(hour, bucket)| {
            let totals = BucketTotals::from_hash(bucket, hour);
            (totals.triggers > 0).then(|| HourlyTrendPoint {
                hour: hour.clone(),
                triggers: totals.triggers,
                average_response_time_ms: totals.average_response_time_ms(),
                success_rate: totals.success_rate(),
            })
        })
        .collect();

    BotAnalytics {
        bot_name: bot_name.to_string(),
        time_range,
        total_triggers,
        total_responses,
        total_failures,
        success_rate: ratio(total_responses, total_triggers),
        average_response_time_ms: if total_responses > 0 {
            total_response_time as f64 / total_responses as f64
        } else {
            0.0
        },
        unique_users: counter(stats, fields::UNIQUE_USERS, &stats_key),
        unique_channels: counter(stats, fields::UNIQUE_CHANNELS, &stats_key),
        last_activity: timestamp_field(stats, fields::LAST_ACTIVITY, &stats_key),
        response_times,
        top_conditions,
        hourly_trends,
    }
}

/// Triggers of one bot within a channel or for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotActivity {
    pub bot_name: String,
    pub triggers: u64,
}

fn bot_activity(hash: &HashMap<String, String>, key: &str) -> Vec<BotActivity> {
    rank_by_count(
        prefixed_counts(hash, fields::BOT_MARKER_PREFIX, key),
        usize::MAX,
    )
    .into_iter()
    .map(|(bot_name, triggers)| BotActivity { bot_name, triggers })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnalytics {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub time_range: TimeRange,
    pub total_triggers: u64,
    pub unique_bots: u64,
    pub unique_users: u64,
    pub last_trigger: Option<DateTime<Utc>>,
    /// Most active bot first
    pub bot_activity: Vec<BotActivity>,
}

pub fn channel_analytics(
    channel_id: &str,
    time_range: TimeRange,
    hash: &HashMap<String, String>,
) -> ChannelAnalytics {
    let key = crate::store::keys::channel_activity(channel_id);
    ChannelAnalytics {
        channel_id: channel_id.to_string(),
        guild_id: hash
            .get(fields::GUILD_ID)
            .filter(|guild| !guild.is_empty())
            .cloned(),
        time_range,
        total_triggers: counter(hash, fields::BOT_TRIGGERS, &key),
        unique_bots: counter(hash, fields::UNIQUE_BOTS, &key),
        unique_users: counter(hash, fields::UNIQUE_USERS, &key),
        last_trigger: timestamp_field(hash, fields::LAST_TRIGGER, &key),
        bot_activity: bot_activity(hash, &key),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAnalytics {
    pub user_id: String,
    pub time_range: TimeRange,
    pub total_triggers: u64,
    pub unique_bots: u64,
    pub unique_channels: u64,
    pub last_trigger: Option<DateTime<Utc>>,
    pub favorite_bot: Option<String>,
    pub most_active_channel: Option<String>,
    pub bot_activity: Vec<BotActivity>,
}

pub fn user_analytics(
    user_id: &str,
    time_range: TimeRange,
    hash: &HashMap<String, String>,
) -> UserAnalytics {
    let key = crate::store::keys::user_interactions(user_id);
    let bot_activity = bot_activity(hash, &key);
    let most_active_channel = rank_by_count(
        prefixed_counts(hash, fields::CHANNEL_MARKER_PREFIX, &key),
        1,
    )
    .into_iter()
    .next()
    .map(|(channel_id, _)| channel_id);

    UserAnalytics {
        user_id: user_id.to_string(),
        time_range,
        total_triggers: counter(hash, fields::BOT_TRIGGERS, &key),
        unique_bots: counter(hash, fields::UNIQUE_BOTS, &key),
        unique_channels: counter(hash, fields::UNIQUE_CHANNELS, &key),
        last_trigger: timestamp_field(hash, fields::LAST_TRIGGER, &key),
        favorite_bot: bot_activity.first().map(|activity| activity.bot_name.clone()),
        most_active_channel,
        bot_activity,
    }
}

/// Counters of one bot in one time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotMetricsAggregation {
    pub bot_name: String,
    pub period: AggregationPeriod,
    /// Bucket key, `YYYY-MM-DDTHH` or `YYYY-MM-DD`
    pub bucket: String,
    pub total_triggers: u64,
    pub total_responses: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub unique_users: u64,
    pub unique_channels: u64,
    pub response_types: BTreeMap<String, u64>,
}

/// Aggregation for one bucket, or `None` when nothing was recorded in it
pub fn bucket_aggregation(
    bot_name: &str,
    period: AggregationPeriod,
    bucket: &str,
    hash: &HashMap<String, String>,
) -> Option<BotMetricsAggregation> {
    let totals = BucketTotals::from_hash(hash, bucket);
    if totals.triggers == 0 {
        return None;
    }
    Some(BotMetricsAggregation {
        bot_name: bot_name.to_string(),
        period,
        bucket: bucket.to_string(),
        total_triggers: totals.triggers,
        total_responses: totals.responses,
        total_failures: totals.failures,
        success_rate: totals.success_rate(),
        average_response_time_ms: totals.average_response_time_ms(),
        min_response_time_ms: optional_counter(hash, fields::MIN_RESPONSE_TIME, bucket),
        max_response_time_ms: optional_counter(hash, fields::MAX_RESPONSE_TIME, bucket),
        unique_users: counter(hash, fields::UNIQUE_USERS, bucket),
        unique_channels: counter(hash, fields::UNIQUE_CHANNELS, bucket),
        response_types: prefixed_counts(hash, fields::RESPONSE_TYPE_PREFIX, bucket)
            .into_iter()
            .collect(),
    })
}

struct BucketTotals {
    triggers: u64,
    responses: u64,
    failures: u64,
    response_time: u64,
}

impl BucketTotals {
    fn from_hash(hash: &HashMap<String, String>, key: &str) -> Self {
        Self {
            triggers: counter(hash, fields::TOTAL_TRIGGERS, key),
            responses: counter(hash, fields::TOTAL_RESPONSES, key),
            failures: counter(hash, fields::TOTAL_FAILURES, key),
            response_time: counter(hash, fields::TOTAL_RESPONSE_TIME, key),
        }
    }

    fn success_rate(&self) -> f64 {
        ratio(self.responses, self.triggers)
    }

    fn average_response_time_ms(&self) -> f64 {
        if self.responses == 0 {
            0.0
        } else {
            self.response_time as f64 / self.responses as f64
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn timestamp_field(hash: &HashMap<String, String>, field: &str, key: &str) -> Option<DateTime<Utc>> {
    let millis = optional_counter(hash, field, key)?;
    DateTime::<Utc>::from_timestamp_millis(i64::try_from(millis).ok()?)
}
