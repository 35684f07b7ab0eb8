//! # Track-trigger update
//!
//! One recorded event touches eight keys: the event record, the per-bot counter
//! hash, the hourly and daily buckets, the channel-activity hash, the
//! user-interaction hash, the per-condition counters and the response-time
//! sorted set.
//!
//! The same update exists in two forms:
//!
//! - [`TRACK_TRIGGER_SCRIPT`], a Lua script the server runs atomically.
//! - [`TrackTriggerPlan`], two rounds of plain commands. The second round holds
//!   the conditional updates (unique counters, min/max) that depend on replies
//!   from the first. Sent as pipelines this is the non-atomic fallback path.

use crate::store::fields;
use crate::store::keys;
use crate::store::{StoreCommand, StoreError, StoreResult, StoreValue};
use chrono::{DateTime, Utc};

/// Server-side scripts known to the event store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScript {
    TrackTrigger,
}

impl StoreScript {
    pub fn name(self) -> &'static str {
        match self {
            StoreScript::TrackTrigger => "track_trigger",
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            StoreScript::TrackTrigger => TRACK_TRIGGER_SCRIPT,
        }
    }

    pub fn key_count(self) -> usize {
        match self {
            StoreScript::TrackTrigger => 8,
        }
    }
}

/// KEYS: event, bot stats, hourly, daily, channel, user, conditions, perf.
/// ARGV: event json, timestamp ms, response time ms, success flag, condition,
/// bot, user, channel, guild, trigger id, response type, then the TTLs for
/// event, hourly, daily, activity and perf keys.
pub const TRACK_TRIGGER_SCRIPT: &str = r#"
local event_key, bot_key, hourly_key, daily_key = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local channel_key, user_key, condition_key, perf_key = KEYS[5], KEYS[6], KEYS[7], KEYS[8]

local timestamp = tonumber(ARGV[2])
local response_time = tonumber(ARGV[3]) or 0
local success = ARGV[4] == '1'
local condition, bot, user, channel = ARGV[5], ARGV[6], ARGV[7], ARGV[8]
local guild, trigger_id, response_type = ARGV[9], ARGV[10], ARGV[11]
local event_ttl, hourly_ttl, daily_ttl = tonumber(ARGV[12]), tonumber(ARGV[13]), tonumber(ARGV[14])
local activity_ttl, perf_ttl = tonumber(ARGV[15]), tonumber(ARGV[16])

local function apply_stats(key)
  redis.call('HINCRBY', key, 'total_triggers', 1)
  if success then
    redis.call('HINCRBY', key, 'total_responses', 1)
    if response_time > 0 then
      redis.call('HINCRBY', key, 'total_response_time', response_time)
    end
  else
    redis.call('HINCRBY', key, 'total_failures', 1)
  end
  if response_time > 0 then
    local current_min = tonumber(redis.call('HGET', key, 'min_response_time'))
    if current_min == nil or response_time < current_min then
      redis.call('HSET', key, 'min_response_time', response_time)
    end
    local current_max = tonumber(redis.call('HGET', key, 'max_response_time'))
    if current_max == nil or response_time > current_max then
      redis.call('HSET', key, 'max_response_time', response_time)
    end
  end
  redis.call('HSET', key, 'last_activity', timestamp)
end

local function first_seen(key, marker)
  return redis.call('HINCRBY', key, marker, 1) == 1
end

redis.call('HSET', event_key, 'data', ARGV[1], 'timestamp', timestamp)
redis.call('EXPIRE', event_key, event_ttl)

apply_stats(bot_key)

for _, bucket in ipairs({hourly_key, daily_key}) do
  apply_stats(bucket)
  if first_seen(bucket, 'user:' .. user) then
    redis.call('HINCRBY', bucket, 'unique_users', 1)
  end
  if first_seen(bucket, 'channel:' .. channel) then
    redis.call('HINCRBY', bucket, 'unique_channels', 1)
  end
  redis.call('HINCRBY', bucket, 'response_type:' .. response_type, 1)
end
redis.call('EXPIRE', hourly_key, hourly_ttl)
redis.call('EXPIRE', daily_key, daily_ttl)

if first_seen(user_key, 'bot:' .. bot) then
  redis.call('HINCRBY', bot_key, 'unique_users', 1)
  redis.call('HINCRBY', user_key, 'unique_bots', 1)
end
if first_seen(user_key, 'channel:' .. channel) then
  redis.call('HINCRBY', user_key, 'unique_channels', 1)
end
redis.call('HINCRBY', user_key, 'bot_triggers', 1)
redis.call('HSET', user_key, 'last_trigger', timestamp)
redis.call('EXPIRE', user_key, activity_ttl)

if first_seen(channel_key, 'bot:' .. bot) then
  redis.call('HINCRBY', bot_key, 'unique_channels', 1)
  redis.call('HINCRBY', channel_key, 'unique_bots', 1)
end
if first_seen(channel_key, 'user:' .. user) then
  redis.call('HINCRBY', channel_key, 'unique_users', 1)
end
redis.call('HINCRBY', channel_key, 'bot_triggers', 1)
redis.call('HSET', channel_key, 'last_trigger', timestamp)
if guild ~= '' then
  redis.call('HSET', channel_key, 'guild_id', guild)
end
redis.call('EXPIRE', channel_key, activity_ttl)

redis.call('HINCRBY', condition_key, condition, 1)
redis.call('EXPIRE', condition_key, activity_ttl)

if response_time > 0 then
  redis.call('ZADD', perf_key, timestamp, response_time .. ':' .. trigger_id)
  redis.call('EXPIRE', perf_key, perf_ttl)
end

return 'OK'
"#;

/// The eight keys touched by one recorded event, in script order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTriggerKeys {
    pub event: String,
    pub bot_stats: String,
    pub hourly: String,
    pub daily: String,
    pub channel: String,
    pub user: String,
    pub conditions: String,
    pub performance: String,
}

impl TrackTriggerKeys {
    pub fn new(
        trigger_id: &str,
        bot_name: &str,
        channel_id: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event: keys::event_record(trigger_id),
            bot_stats: keys::bot_stats(bot_name),
            hourly: keys::bot_hourly(bot_name, &keys::hour_key(timestamp)),
            daily: keys::bot_daily(bot_name, &keys::day_key(timestamp)),
            channel: keys::channel_activity(channel_id),
            user: keys::user_interactions(user_id),
            conditions: keys::bot_conditions(bot_name),
            performance: keys::bot_performance(bot_name),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        vec![
            self.event.clone(),
            self.bot_stats.clone(),
            self.hourly.clone(),
            self.daily.clone(),
            self.channel.clone(),
            self.user.clone(),
            self.conditions.clone(),
            self.performance.clone(),
        ]
    }

    pub fn from_slice(keys: &[String]) -> StoreResult<Self> {
        match keys {
            [event, bot_stats, hourly, daily, channel, user, conditions, performance] => Ok(Self {
                event: event.clone(),
                bot_stats: bot_stats.clone(),
                hourly: hourly.clone(),
                daily: daily.clone(),
                channel: channel.clone(),
                user: user.clone(),
                conditions: conditions.clone(),
                performance: performance.clone(),
            }),
            _ => Err(StoreError::ScriptError(format!(
                "track_trigger expects 8 keys, got {}",
                keys.len()
            ))),
        }
    }
}

/// Script arguments for one recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTriggerArgs {
    pub event_json: String,
    pub timestamp_ms: i64,
    pub response_time_ms: u64,
    pub success: bool,
    pub condition_name: String,
    pub bot_name: String,
    pub user_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub trigger_id: String,
    pub response_type: String,
    pub event_ttl_secs: u64,
    pub hourly_ttl_secs: u64,
    pub daily_ttl_secs: u64,
    pub activity_ttl_secs: u64,
    pub performance_ttl_secs: u64,
}

impl TrackTriggerArgs {
    const ARG_COUNT: usize = 16;

    pub fn to_vec(&self) -> Vec<String> {
        vec![
            self.event_json.clone(),
            self.timestamp_ms.to_string(),
            self.response_time_ms.to_string(),
            if self.success { "1" } else { "0" }.to_string(),
            self.condition_name.clone(),
            self.bot_name.clone(),
            self.user_id.clone(),
            self.channel_id.clone(),
            self.guild_id.clone().unwrap_or_default(),
            self.trigger_id.clone(),
            self.response_type.clone(),
            self.event_ttl_secs.to_string(),
            self.hourly_ttl_secs.to_string(),
            self.daily_ttl_secs.to_string(),
            self.activity_ttl_secs.to_string(),
            self.performance_ttl_secs.to_string(),
        ]
    }

    pub fn from_slice(args: &[String]) -> StoreResult<Self> {
        if args.len() != Self::ARG_COUNT {
            return Err(StoreError::ScriptError(format!(
                "track_trigger expects {} arguments, got {}",
                Self::ARG_COUNT,
                args.len()
            )));
        }

        fn number<T: std::str::FromStr>(raw: &str, name: &str) -> StoreResult<T> {
            raw.parse()
                .map_err(|_| StoreError::ScriptError(format!("argument {name} is not a number: {raw}")))
        }

        Ok(Self {
            event_json: args[0].clone(),
            timestamp_ms: number(&args[1], "timestamp")?,
            response_time_ms: number(&args[2], "response_time")?,
            success: args[3] == "1",
            condition_name: args[4].clone(),
            bot_name: args[5].clone(),
            user_id: args[6].clone(),
            channel_id: args[7].clone(),
            guild_id: Some(args[8].clone()).filter(|guild| !guild.is_empty()),
            trigger_id: args[9].clone(),
            response_type: args[10].clone(),
            event_ttl_secs: number(&args[11], "event_ttl")?,
            hourly_ttl_secs: number(&args[12], "hourly_ttl")?,
            daily_ttl_secs: number(&args[13], "daily_ttl")?,
            activity_ttl_secs: number(&args[14], "activity_ttl")?,
            performance_ttl_secs: number(&args[15], "perf_ttl")?,
        })
    }
}

/// Reply positions of the first round that drive the second round
#[derive(Debug, Clone, Default)]
struct PlanSlots {
    /// (stats key, index of the HMGET min/max read)
    ranges: Vec<(String, usize)>,
    /// (bucket key, user marker index, channel marker index)
    bucket_markers: Vec<(String, usize, usize)>,
    user_bot: usize,
    user_channel: usize,
    channel_bot: usize,
    channel_user: usize,
}

/// The track-trigger update expressed as plain commands
#[derive(Debug, Clone)]
pub struct TrackTriggerPlan {
    keys: TrackTriggerKeys,
    args: TrackTriggerArgs,
    first_round: Vec<StoreCommand>,
    slots: PlanSlots,
}

impl TrackTriggerPlan {
    pub fn new(keys: TrackTriggerKeys, args: TrackTriggerArgs) -> Self {
        let mut commands = Vec::with_capacity(48);
        let mut slots = PlanSlots::default();
        let response_time = args.response_time_ms as i64;

        commands.push(StoreCommand::hset(&keys.event, fields::EVENT_DATA, &args.event_json));
        commands.push(StoreCommand::hset(&keys.event, fields::EVENT_TIMESTAMP, args.timestamp_ms));
        commands.push(StoreCommand::expire(&keys.event, args.event_ttl_secs));

        for stats_key in [&keys.bot_stats, &keys.hourly, &keys.daily] {
            if response_time > 0 {
                slots.ranges.push((stats_key.clone(), commands.len()));
                commands.push(StoreCommand::hmget(
                    stats_key,
                    &[fields::MIN_RESPONSE_TIME, fields::MAX_RESPONSE_TIME],
                ));
            }
            commands.push(StoreCommand::hincrby(stats_key, fields::TOTAL_TRIGGERS, 1));
            if args.success {
                commands.push(StoreCommand::hincrby(stats_key, fields::TOTAL_RESPONSES, 1));
                if response_time > 0 {
                    commands.push(StoreCommand::hincrby(
                        stats_key,
                        fields::TOTAL_RESPONSE_TIME,
                        response_time,
                    ));
                }
            } else {
                commands.push(StoreCommand::hincrby(stats_key, fields::TOTAL_FAILURES, 1));
            }
            commands.push(StoreCommand::hset(stats_key, fields::LAST_ACTIVITY, args.timestamp_ms));
        }

        for (bucket, ttl) in [
            (&keys.hourly, args.hourly_ttl_secs),
            (&keys.daily, args.daily_ttl_secs),
        ] {
            let user_slot = commands.len();
            commands.push(StoreCommand::hincrby(bucket, fields::user_marker(&args.user_id), 1));
            let channel_slot = commands.len();
            commands.push(StoreCommand::hincrby(bucket, fields::channel_marker(&args.channel_id), 1));
            slots.bucket_markers.push((bucket.clone(), user_slot, channel_slot));
            commands.push(StoreCommand::hincrby(
                bucket,
                fields::response_type_field(&args.response_type),
                1,
            ));
            commands.push(StoreCommand::expire(bucket, ttl));
        }

        slots.user_bot = commands.len();
        commands.push(StoreCommand::hincrby(&keys.user, fields::bot_marker(&args.bot_name), 1));
        slots.user_channel = commands.len();
        commands.push(StoreCommand::hincrby(&keys.user, fields::channel_marker(&args.channel_id), 1));
        commands.push(StoreCommand::hincrby(&keys.user, fields::BOT_TRIGGERS, 1));
        commands.push(StoreCommand::hset(&keys.user, fields::LAST_TRIGGER, args.timestamp_ms));
        commands.push(StoreCommand::expire(&keys.user, args.activity_ttl_secs));

        slots.channel_bot = commands.len();
        commands.push(StoreCommand::hincrby(&keys.channel, fields::bot_marker(&args.bot_name), 1));
        slots.channel_user = commands.len();
        commands.push(StoreCommand::hincrby(&keys.channel, fields::user_marker(&args.user_id), 1));
        commands.push(StoreCommand::hincrby(&keys.channel, fields::BOT_TRIGGERS, 1));
        commands.push(StoreCommand::hset(&keys.channel, fields::LAST_TRIGGER, args.timestamp_ms));
        if let Some(guild_id) = &args.guild_id {
            commands.push(StoreCommand::hset(&keys.channel, fields::GUILD_ID, guild_id));
        }
        commands.push(StoreCommand::expire(&keys.channel, args.activity_ttl_secs));

        commands.push(StoreCommand::hincrby(&keys.conditions, &args.condition_name, 1));
        commands.push(StoreCommand::expire(&keys.conditions, args.activity_ttl_secs));

        if response_time > 0 {
            commands.push(StoreCommand::zadd(
                &keys.performance,
                args.timestamp_ms as f64,
                format!("{}:{}", args.response_time_ms, args.trigger_id),
            ));
            commands.push(StoreCommand::expire(&keys.performance, args.performance_ttl_secs));
        }

        Self {
            keys,
            args,
            first_round: commands,
            slots,
        }
    }

    pub fn keys(&self) -> &TrackTriggerKeys {
        &self.keys
    }

    /// Unconditional increments and the reads the second round depends on
    pub fn first_round(&self) -> &[StoreCommand] {
        &self.first_round
    }

    /// Conditional updates derived from the first round's replies. A failed or
    /// missing reply skips the update that depends on it.
    pub fn second_round(&self, replies: &[StoreResult<StoreValue>]) -> Vec<StoreCommand> {
        let first_seen = |index: usize| {
            matches!(
                replies.get(index).and_then(|reply| reply.as_ref().ok()),
                Some(value) if value.as_integer() == Some(1)
            )
        };
        let keys = &self.keys;
        let mut commands = Vec::new();

        if first_seen(self.slots.user_bot) {
            commands.push(StoreCommand::hincrby(&keys.bot_stats, fields::UNIQUE_USERS, 1));
            commands.push(StoreCommand::hincrby(&keys.user, fields::UNIQUE_BOTS, 1));
        }
        if first_seen(self.slots.user_channel) {
            commands.push(StoreCommand::hincrby(&keys.user, fields::UNIQUE_CHANNELS, 1));
        }
        if first_seen(self.slots.channel_bot) {
            commands.push(StoreCommand::hincrby(&keys.bot_stats, fields::UNIQUE_CHANNELS, 1));
            commands.push(StoreCommand::hincrby(&keys.channel, fields::UNIQUE_BOTS, 1));
        }
        if first_seen(self.slots.channel_user) {
            commands.push(StoreCommand::hincrby(&keys.channel, fields::UNIQUE_USERS, 1));
        }
        for (bucket, user_slot, channel_slot) in &self.slots.bucket_markers {
            if first_seen(*user_slot) {
                commands.push(StoreCommand::hincrby(bucket, fields::UNIQUE_USERS, 1));
            }
            if first_seen(*channel_slot) {
                commands.push(StoreCommand::hincrby(bucket, fields::UNIQUE_CHANNELS, 1));
            }
        }

        let response_time = self.args.response_time_ms;
        for (stats_key, slot) in &self.slots.ranges {
            let Some(Ok(StoreValue::Fields(current))) = replies.get(*slot) else {
                continue;
            };
            let parse = |value: Option<&Option<String>>| {
                value
                    .and_then(|raw| raw.as_deref())
                    .and_then(|raw| raw.parse::<f64>().ok())
            };
            let current_min = parse(current.first());
            let current_max = parse(current.get(1));

            if current_min.map_or(true, |min| (response_time as f64) < min) {
                commands.push(StoreCommand::hset(stats_key, fields::MIN_RESPONSE_TIME, response_time));
            }
            if current_max.map_or(true, |max| (response_time as f64) > max) {
                commands.push(StoreCommand::hset(stats_key, fields::MAX_RESPONSE_TIME, response_time));
            }
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_args(response_time_ms: u64, success: bool) -> TrackTriggerArgs {
        TrackTriggerArgs {
            event_json: "{}".to_string(),
            timestamp_ms: 1_710_000_000_000,
            response_time_ms,
            success,
            condition_name: "assassin".to_string(),
            bot_name: "EzioBot".to_string(),
            user_id: "u1".to_string(),
            channel_id: "c1".to_string(),
            guild_id: Some("g1".to_string()),
            trigger_id: "t1".to_string(),
            response_type: "message".to_string(),
            event_ttl_secs: 604_800,
            hourly_ttl_secs: 2_592_000,
            daily_ttl_secs: 7_776_000,
            activity_ttl_secs: 2_592_000,
            performance_ttl_secs: 604_800,
        }
    }

    fn sample_keys() -> TrackTriggerKeys {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 16, 0, 0).unwrap();
        TrackTriggerKeys::new("t1", "EzioBot", "c1", "u1", ts)
    }

    #[test]
    fn test_args_survive_script_argument_encoding() {
        let args = sample_args(120, true);
        let encoded = args.to_vec();
        assert_eq!(encoded.len(), 16);
        assert_eq!(TrackTriggerArgs::from_slice(&encoded).unwrap(), args);

        let keys = sample_keys();
        assert_eq!(TrackTriggerKeys::from_slice(&keys.to_vec()).unwrap(), keys);
        assert!(TrackTriggerKeys::from_slice(&keys.to_vec()[..3]).is_err());
    }

    #[test]
    fn test_first_round_touches_all_eight_keys() {
        let plan = TrackTriggerPlan::new(sample_keys(), sample_args(120, true));
        let touched: std::collections::HashSet<&str> =
            plan.first_round().iter().map(|command| command.key()).collect();
        for key in plan.keys().to_vec() {
            assert!(touched.contains(key.as_str()), "missing {key}");
        }
    }

    #[test]
    fn test_zero_response_time_skips_performance_sample() {
        let plan = TrackTriggerPlan::new(sample_keys(), sample_args(0, false));
        assert!(!plan
            .first_round()
            .iter()
            .any(|command| command.key() == plan.keys().performance));
        assert!(plan
            .first_round()
            .iter()
            .all(|command| !matches!(command, StoreCommand::HashGetFields { .. })));
    }

    #[test]
    fn test_second_round_follows_first_seen_markers() {
        let plan = TrackTriggerPlan::new(sample_keys(), sample_args(120, true));
        // Every marker reports a repeat visit and min/max are already tighter
        let replies: Vec<StoreResult<StoreValue>> = plan
            .first_round()
            .iter()
            .map(|command| match command {
                StoreCommand::HashGetFields { .. } => Ok(StoreValue::Fields(vec![
                    Some("50".to_string()),
                    Some("500".to_string()),
                ])),
                _ => Ok(StoreValue::Integer(2)),
            })
            .collect();
        assert!(plan.second_round(&replies).is_empty());

        // A fresh store: every marker is new and min/max are unset
        let replies: Vec<StoreResult<StoreValue>> = plan
            .first_round()
            .iter()
            .map(|command| match command {
                StoreCommand::HashGetFields { .. } => Ok(StoreValue::Fields(vec![None, None])),
                _ => Ok(StoreValue::Integer(1)),
            })
            .collect();
        let second = plan.second_round(&replies);
        assert!(second.contains(&StoreCommand::hincrby(&plan.keys().bot_stats, fields::UNIQUE_USERS, 1)));
        assert!(second.contains(&StoreCommand::hincrby(&plan.keys().channel, fields::UNIQUE_BOTS, 1)));
        assert!(second.contains(&StoreCommand::hset(&plan.keys().daily, fields::MAX_RESPONSE_TIME, 120)));
    }
}
