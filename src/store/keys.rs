//! Persisted key layout.
//!
//! Every aggregation entity lives under its own namespaced key. Hourly and daily
//! buckets deliberately do not end in `:stats`, so the exporter's bot scan only
//! sees the rolling counter hashes.

use chrono::{DateTime, Utc};

/// Scan pattern for per-bot rolling counters
pub const BOT_STATS_PATTERN: &str = "bot:*:stats";

/// Scan pattern for per-channel activity hashes
pub const CHANNEL_ACTIVITY_PATTERN: &str = "channel:*:activity";

const HOUR_FORMAT: &str = "%Y-%m-%dT%H";
const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn event_record(trigger_id: &str) -> String {
    format!("trigger:event:{trigger_id}")
}

pub fn bot_stats(bot_name: &str) -> String {
    format!("bot:{bot_name}:stats")
}

pub fn bot_conditions(bot_name: &str) -> String {
    format!("bot:{bot_name}:conditions")
}

pub fn bot_performance(bot_name: &str) -> String {
    format!("bot:{bot_name}:perf")
}

/// Hourly bucket key for an already-truncated time key (`YYYY-MM-DDTHH`)
pub fn bot_hourly(bot_name: &str, hour_key: &str) -> String {
    format!("bot:{bot_name}:hourly:{hour_key}")
}

/// Daily bucket key for an already-truncated time key (`YYYY-MM-DD`)
pub fn bot_daily(bot_name: &str, day_key: &str) -> String {
    format!("bot:{bot_name}:daily:{day_key}")
}

pub fn channel_activity(channel_id: &str) -> String {
    format!("channel:{channel_id}:activity")
}

pub fn user_interactions(user_id: &str) -> String {
    format!("user:{user_id}:interactions")
}

/// Truncate a timestamp to its hourly bucket key
pub fn hour_key(timestamp: DateTime<Utc>) -> String {
    timestamp.format(HOUR_FORMAT).to_string()
}

/// Truncate a timestamp to its daily bucket key
pub fn day_key(timestamp: DateTime<Utc>) -> String {
    timestamp.format(DAY_FORMAT).to_string()
}

/// Extract the bot name from a `bot:<name>:stats` key
pub fn bot_name_from_stats_key(key: &str) -> Option<&str> {
    key.strip_prefix("bot:")?
        .strip_suffix(":stats")
        .filter(|name| !name.is_empty())
}

/// Extract the channel id from a `channel:<id>:activity` key
pub fn channel_id_from_activity_key(key: &str) -> Option<&str> {
    key.strip_prefix("channel:")?
        .strip_suffix(":activity")
        .filter(|id| !id.is_empty())
}
