//! Hash field names shared by the writers and readers, and defensive parsing.
//!
//! Readers never fail on a bad field: missing values read as zero and
//! non-numeric values read as zero with a warning.

use std::collections::HashMap;
use tracing::warn;

pub const TOTAL_TRIGGERS: &str = "total_triggers";
pub const TOTAL_RESPONSES: &str = "total_responses";
pub const TOTAL_FAILURES: &str = "total_failures";
pub const TOTAL_RESPONSE_TIME: &str = "total_response_time";
pub const MIN_RESPONSE_TIME: &str = "min_response_time";
pub const MAX_RESPONSE_TIME: &str = "max_response_time";
pub const UNIQUE_USERS: &str = "unique_users";
pub const UNIQUE_CHANNELS: &str = "unique_channels";
pub const UNIQUE_BOTS: &str = "unique_bots";
pub const LAST_ACTIVITY: &str = "last_activity";
pub const BOT_TRIGGERS: &str = "bot_triggers";
pub const LAST_TRIGGER: &str = "last_trigger";
pub const GUILD_ID: &str = "guild_id";
pub const EVENT_DATA: &str = "data";
pub const EVENT_TIMESTAMP: &str = "timestamp";

pub const BOT_MARKER_PREFIX: &str = "bot:";
pub const USER_MARKER_PREFIX: &str = "user:";
pub const CHANNEL_MARKER_PREFIX: &str = "channel:";
pub const RESPONSE_TYPE_PREFIX: &str = "response_type:";

pub fn bot_marker(bot_name: &str) -> String {
    format!("{BOT_MARKER_PREFIX}{bot_name}")
}

pub fn user_marker(user_id: &str) -> String {
    format!("{USER_MARKER_PREFIX}{user_id}")
}

pub fn channel_marker(channel_id: &str) -> String {
    format!("{CHANNEL_MARKER_PREFIX}{channel_id}")
}

pub fn response_type_field(label: &str) -> String {
    format!("{RESPONSE_TYPE_PREFIX}{label}")
}

/// Parse an unsigned counter; missing or malformed values read as 0
pub fn counter(hash: &HashMap<String, String>, field: &str, key: &str) -> u64 {
    match hash.get(field) {
        None => 0,
        Some(raw) => parse_counter_value(raw, field, key),
    }
}

/// Parse an optional counter; missing reads as `None`, malformed as `None` with a warning
pub fn optional_counter(hash: &HashMap<String, String>, field: &str, key: &str) -> Option<u64> {
    let raw = hash.get(field)?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Some(value as u64),
        _ => {
            warn!(key = %key, field = %field, value = %raw, "Non-numeric field ignored");
            None
        }
    }
}

/// Parse a counter value from its raw string form
pub fn parse_counter_value(raw: &str, field: &str, key: &str) -> u64 {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<u64>() {
        return value;
    }
    // Lua writes whole numbers through HSET as floats on some servers ("12.0")
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value as u64,
        _ => {
            warn!(key = %key, field = %field, value = %raw, "Non-numeric counter read as 0");
            0
        }
    }
}

/// Collect `<prefix><name> -> count` fields into (name, count) pairs
pub fn prefixed_counts(hash: &HashMap<String, String>, prefix: &str, key: &str) -> Vec<(String, u64)> {
    hash.iter()
        .filter_map(|(field, raw)| {
            let name = field.strip_prefix(prefix)?;
            Some((name.to_string(), parse_counter_value(raw, field, key)))
        })
        .collect()
}

/// Sort (name, count) pairs by count descending, ties by name ascending, and keep `limit`
pub fn rank_by_count(mut entries: Vec<(String, u64)>, limit: usize) -> Vec<(String, u64)> {
    entries.sort_by(|(name_a, count_a), (name_b, count_b)| {
        count_b.cmp(count_a).then_with(|| name_a.cmp(name_b))
    });
    entries.truncate(limit);
    entries
}
