//! # Trigger Events
//!
//! The records produced by the bot trigger-decision pipeline, and the filter and
//! time-range types used to query what was recorded.
//!
//! A [`TriggerEvent`] is consumed exactly once by the recorder and never mutated
//! afterwards. Soft problems (empty ids, impossible timestamps) are repaired by
//! [`TriggerEvent::normalize`] instead of rejecting the event.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Events further in the future than this are treated as clock errors
const MAX_CLOCK_SKEW_HOURS: i64 = 24;

/// Placeholder for empty bot or condition names
pub const UNKNOWN: &str = "unknown";

/// How the bot answered a trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseKind {
    /// A chat message reply
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_length: Option<u32>,
    },
    /// An emoji reaction on the triggering message
    Reaction { emoji: String },
    /// A message sent through a webhook identity
    Webhook {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },
    /// The trigger matched but nothing was sent
    None,
}

impl ResponseKind {
    /// Label stored in bucket hashes and exported series
    pub fn label(&self) -> &'static str {
        match self {
            ResponseKind::Message { .. } => "message",
            ResponseKind::Reaction { .. } => "reaction",
            ResponseKind::Webhook { .. } => "webhook",
            ResponseKind::None => "none",
        }
    }
}

impl Default for ResponseKind {
    fn default() -> Self {
        ResponseKind::Message {
            content_length: None,
        }
    }
}

/// One bot trigger decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub bot_name: String,
    pub condition_name: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub message_id: String,
    /// Time from trigger to response; 0 when no response was timed
    #[serde(default)]
    pub response_time_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub response: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Opaque caller-supplied attributes, stored with the event record only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A soft validation problem that was repaired with a default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: &'static str,
    pub problem: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

impl TriggerEvent {
    /// A successful message response recorded now, with a fresh trigger id
    pub fn new(
        bot_name: impl Into<String>,
        condition_name: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            bot_name: bot_name.into(),
            condition_name: condition_name.into(),
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            guild_id: None,
            message_id: message_id.into(),
            response_time_ms: 0,
            success: true,
            response: ResponseKind::default(),
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_trigger_id(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = trigger_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp_ms = timestamp.timestamp_millis();
        self
    }

    pub fn with_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    pub fn with_response_time_ms(mut self, response_time_ms: u64) -> Self {
        self.response_time_ms = response_time_ms;
        self
    }

    pub fn with_response(mut self, response: ResponseKind) -> Self {
        self.response = response;
        self
    }

    /// Mark the trigger as failed with a reason
    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error_message.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Event time, if the stored timestamp is representable
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
    }

    /// Repair soft validation problems in place, returning what was repaired
    pub fn normalize(&mut self, now: DateTime<Utc>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.trigger_id.trim().is_empty() {
            self.trigger_id = uuid::Uuid::new_v4().to_string();
            issues.push(ValidationIssue {
                field: "trigger_id",
                problem: "empty, generated a new id".to_string(),
            });
        }

        let latest_allowed = now + ChronoDuration::hours(MAX_CLOCK_SKEW_HOURS);
        let timestamp_problem = match self.timestamp() {
            _ if self.timestamp_ms <= 0 => Some(format!("non-positive value {}", self.timestamp_ms)),
            None => Some(format!("unrepresentable value {}", self.timestamp_ms)),
            Some(ts) if ts > latest_allowed => Some(format!("{} is in the future", ts.to_rfc3339())),
            Some(_) => None,
        };
        if let Some(problem) = timestamp_problem {
            self.timestamp_ms = now.timestamp_millis();
            issues.push(ValidationIssue {
                field: "timestamp",
                problem: format!("{problem}, substituted current time"),
            });
        }

        for (field, value) in [
            ("bot_name", &mut self.bot_name),
            ("condition_name", &mut self.condition_name),
            ("user_id", &mut self.user_id),
            ("channel_id", &mut self.channel_id),
        ] {
            if value.trim().is_empty() {
                *value = UNKNOWN.to_string();
                issues.push(ValidationIssue {
                    field,
                    problem: format!("empty, substituted '{UNKNOWN}'"),
                });
            }
        }

        if self.guild_id.as_deref().is_some_and(|guild| guild.trim().is_empty()) {
            self.guild_id = None;
        }

        issues
    }
}

/// Granularity of time buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPeriod {
    #[default]
    Hour,
    Day,
}

impl AggregationPeriod {
    pub fn step(self) -> TimeDelta {
        match self {
            AggregationPeriod::Hour => TimeDelta::hours(1),
            AggregationPeriod::Day => TimeDelta::days(1),
        }
    }

    /// Bucket key for a timestamp at this granularity
    pub fn bucket_key(self, timestamp: DateTime<Utc>) -> String {
        match self {
            AggregationPeriod::Hour => crate::store::keys::hour_key(timestamp),
            AggregationPeriod::Day => crate::store::keys::day_key(timestamp),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationPeriod::Hour => "hour",
            AggregationPeriod::Day => "day",
        }
    }
}

/// Closed time interval for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub period: AggregationPeriod,
}

impl TimeRange {
    /// Range with its endpoints ordered
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, period: AggregationPeriod) -> Self {
        if start <= end {
            Self { start, end, period }
        } else {
            Self {
                start: end,
                end: start,
                period,
            }
        }
    }

    /// The trailing `hours` up to now, bucketed hourly
    pub fn last_hours(hours: u32) -> Self {
        let end = Utc::now();
        Self::new(
            end - TimeDelta::hours(i64::from(hours)),
            end,
            AggregationPeriod::Hour,
        )
    }

    pub fn with_period(mut self, period: AggregationPeriod) -> Self {
        self.period = period;
        self
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Bucket keys covering the range at its period, oldest first, at most `limit`
    /// (the most recent buckets are kept when the range is longer).
    pub fn bucket_keys(&self, limit: usize) -> Vec<String> {
        let step = self.period.step();
        let mut cursor = self.start.duration_trunc(step).unwrap_or(self.start);
        let mut keys = Vec::new();

        while cursor <= self.end {
            keys.push(self.period.bucket_key(cursor));
            cursor += step;
        }

        if keys.len() > limit {
            keys.drain(..keys.len() - limit);
        }
        keys
    }
}

/// Selection criteria for bot queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bot_names: Vec<String>,
}

impl MetricsFilter {
    pub fn for_bot(bot_name: impl Into<String>) -> Self {
        Self {
            bot_name: Some(bot_name.into()),
            bot_names: Vec::new(),
        }
    }

    pub fn for_bots<I, S>(bot_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bot_name: None,
            bot_names: bot_names.into_iter().map(Into::into).collect(),
        }
    }

    /// The single bot this filter names, if it names a non-empty one
    pub fn primary_bot(&self) -> Option<&str> {
        self.bot_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Every named bot, deduplicated, in first-seen order
    pub fn all_bots(&self) -> Vec<String> {
        let mut bots: Vec<String> = Vec::new();
        for name in self.primary_bot().into_iter().chain(
            self.bot_names
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty()),
        ) {
            if !bots.iter().any(|existing| existing == name) {
                bots.push(name.to_string());
            }
        }
        bots
    }
}
