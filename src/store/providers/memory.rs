//! In-process event store.
//!
//! Implements the full [`EventStore`] surface against a single mutex-guarded
//! keyspace. Scripts run under one lock acquisition, which gives them the same
//! all-or-nothing visibility the Redis script has. Expirations use
//! [`tokio::time::Instant`] so paused-clock tests can age keys out.
//!
//! Fault injection hooks make outage and fallback paths testable without a server:
//! [`MemoryEventStore::set_available`], [`MemoryEventStore::set_scripting`] and
//! [`MemoryEventStore::fail_commands_matching`].

use crate::store::scripts::{TrackTriggerArgs, TrackTriggerKeys, TrackTriggerPlan};
use crate::store::{
    EventStore, ScanPage, StoreCommand, StoreError, StoreResult, StoreScript, StoreValue,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
enum MemoryValue {
    Hash(HashMap<String, String>),
    SortedSet(Vec<(f64, String)>),
}

#[derive(Debug, Default)]
struct Keyspace {
    // BTreeMap keeps scan order stable across calls
    entries: BTreeMap<String, MemoryValue>,
    expirations: HashMap<String, Instant>,
}

impl Keyspace {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expirations.remove(&key);
            self.entries.remove(&key);
        }
    }

    fn hash(&self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(MemoryValue::Hash(hash)) => Ok(Some(hash)),
            Some(MemoryValue::SortedSet(_)) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        let value = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryValue::Hash(HashMap::new()));
        match value {
            MemoryValue::Hash(hash) => Ok(hash),
            MemoryValue::SortedSet(_) => Err(wrong_type(key)),
        }
    }

    fn execute(&mut self, command: &StoreCommand, now: Instant) -> StoreResult<StoreValue> {
        match command {
            StoreCommand::HashIncrBy { key, field, delta } => {
                let hash = self.hash_mut(key)?;
                let current = match hash.get(field) {
                    None => 0,
                    Some(raw) => raw.parse::<i64>().map_err(|_| {
                        StoreError::backend("HINCRBY", "hash value is not an integer")
                    })?,
                };
                let updated = current + delta;
                hash.insert(field.clone(), updated.to_string());
                Ok(StoreValue::Integer(updated))
            }
            StoreCommand::HashSet { key, field, value } => {
                let hash = self.hash_mut(key)?;
                let created = hash.insert(field.clone(), value.clone()).is_none();
                Ok(StoreValue::Integer(i64::from(created)))
            }
            StoreCommand::HashGetAll { key } => Ok(StoreValue::Hash(
                self.hash(key)?.cloned().unwrap_or_default(),
            )),
            StoreCommand::HashGetFields { key, fields } => {
                let hash = self.hash(key)?;
                Ok(StoreValue::Fields(
                    fields
                        .iter()
                        .map(|field| hash.and_then(|h| h.get(field).cloned()))
                        .collect(),
                ))
            }
            StoreCommand::Expire { key, seconds } => {
                if !self.entries.contains_key(key) {
                    return Ok(StoreValue::Integer(0));
                }
                self.expirations
                    .insert(key.clone(), now + Duration::from_secs(*seconds));
                Ok(StoreValue::Integer(1))
            }
            StoreCommand::SortedSetAdd { key, score, member } => {
                let value = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| MemoryValue::SortedSet(Vec::new()));
                let MemoryValue::SortedSet(set) = value else {
                    return Err(wrong_type(key));
                };
                let added = match set.iter_mut().find(|(_, existing)| existing == member) {
                    Some(entry) => {
                        entry.0 = *score;
                        0
                    }
                    None => {
                        set.push((*score, member.clone()));
                        1
                    }
                };
                set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(StoreValue::Integer(added))
            }
            StoreCommand::SortedSetRangeByScore {
                key,
                min,
                max,
                limit,
            } => {
                let members = match self.entries.get(key) {
                    None => Vec::new(),
                    Some(MemoryValue::Hash(_)) => return Err(wrong_type(key)),
                    Some(MemoryValue::SortedSet(set)) => set
                        .iter()
                        .filter(|(score, _)| *score >= *min && *score <= *max)
                        .take(limit.unwrap_or(usize::MAX))
                        .map(|(_, member)| member.clone())
                        .collect(),
                };
                Ok(StoreValue::Members(members))
            }
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::backend(
        key,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )
}

/// Minimal glob matcher supporting `*` and `?`
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0, 0);
    let (mut star, mut star_match) = (None, 0);

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_match = c;
            p += 1;
        } else if let Some(star_pos) = star {
            p = star_pos + 1;
            star_match += 1;
            c = star_match;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}

/// Call counters for assertions in tests
#[derive(Debug, Default)]
struct MemoryStoreCounters {
    connects: AtomicU64,
    scans: AtomicU64,
    scripts: AtomicU64,
    pipelines: AtomicU64,
    reads: AtomicU64,
}

/// Snapshot of [`MemoryEventStore`] call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub connects: u64,
    pub scans: u64,
    pub scripts: u64,
    pub pipelines: u64,
    pub reads: u64,
}

/// In-process [`EventStore`] with fault injection
#[derive(Debug)]
pub struct MemoryEventStore {
    keyspace: Mutex<Keyspace>,
    connected: AtomicBool,
    available: AtomicBool,
    scripting: AtomicBool,
    failing_patterns: Mutex<Vec<String>>,
    counters: MemoryStoreCounters,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            scripting: AtomicBool::new(true),
            failing_patterns: Mutex::new(Vec::new()),
            counters: MemoryStoreCounters::default(),
        }
    }

    /// Simulate a full outage: every call fails with a connection error
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a server without scripting support
    pub fn set_scripting(&self, enabled: bool) {
        self.scripting.store(enabled, Ordering::SeqCst);
    }

    /// Pipeline write commands whose key contains `fragment` fail individually
    pub fn fail_commands_matching(&self, fragment: impl Into<String>) {
        self.failing_patterns.lock().push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.failing_patterns.lock().clear();
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            connects: self.counters.connects.load(Ordering::Relaxed),
            scans: self.counters.scans.load(Ordering::Relaxed),
            scripts: self.counters.scripts.load(Ordering::Relaxed),
            pipelines: self.counters.pipelines.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
        }
    }

    /// Keys currently present, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired(Instant::now());
        keyspace.entries.keys().cloned().collect()
    }

    /// Remaining time-to-live of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let keyspace = self.keyspace.lock();
        keyspace
            .expirations
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Overwrite a single hash field directly, bypassing fault injection
    pub fn seed_hash_field(&self, key: &str, field: &str, value: &str) {
        let mut keyspace = self.keyspace.lock();
        if let Ok(hash) = keyspace.hash_mut(key) {
            hash.insert(field.to_string(), value.to_string());
        }
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionError(
                "memory store unavailable".to_string(),
            ));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        Ok(())
    }

    fn is_failing(&self, command: &StoreCommand) -> bool {
        command.is_write()
            && self
                .failing_patterns
                .lock()
                .iter()
                .any(|fragment| command.key().contains(fragment.as_str()))
    }

    fn read<T>(&self, f: impl FnOnce(&mut Keyspace) -> StoreResult<T>) -> StoreResult<T> {
        self.ensure_usable()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired(Instant::now());
        f(&mut keyspace)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn connect(&self) -> StoreResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionError(
                "memory store unavailable".to_string(),
            ));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.counters.connects.fetch_add(1, Ordering::Relaxed);
            debug!("Memory event store connected");
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.available.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> StoreResult<Duration> {
        let start = Instant::now();
        self.ensure_usable()?;
        Ok(start.elapsed())
    }

    async fn run_script(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<StoreValue> {
        self.ensure_usable()?;
        self.counters.scripts.fetch_add(1, Ordering::Relaxed);
        if !self.scripting.load(Ordering::SeqCst) {
            return Err(StoreError::ScriptError(format!(
                "ERR unknown command 'EVALSHA' for script {}",
                script.name()
            )));
        }

        match script {
            StoreScript::TrackTrigger => {
                let plan = TrackTriggerPlan::new(
                    TrackTriggerKeys::from_slice(keys)?,
                    TrackTriggerArgs::from_slice(args)?,
                );
                let now = Instant::now();
                let mut keyspace = self.keyspace.lock();
                keyspace.purge_expired(now);

                // Scripts abort on the first error, like the server does
                let mut replies = Vec::with_capacity(plan.first_round().len());
                for command in plan.first_round() {
                    replies.push(Ok(keyspace.execute(command, now)?));
                }
                for command in plan.second_round(&replies) {
                    keyspace.execute(&command, now)?;
                }
                Ok(StoreValue::Text("OK".to_string()))
            }
        }
    }

    async fn pipeline(&self, commands: &[StoreCommand]) -> StoreResult<Vec<StoreResult<StoreValue>>> {
        self.ensure_usable()?;
        self.counters.pipelines.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired(now);

        Ok(commands
            .iter()
            .map(|command| {
                if self.is_failing(command) {
                    Err(StoreError::backend(command.name(), "injected failure"))
                } else {
                    keyspace.execute(command, now)
                }
            })
            .collect())
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage> {
        self.ensure_usable()?;
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired(Instant::now());

        let matching: Vec<&String> = keyspace
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .collect();
        let start = (cursor as usize).min(matching.len());
        let end = (start + count.max(1)).min(matching.len());
        let next_cursor = if end >= matching.len() { 0 } else { end as u64 };

        Ok(ScanPage {
            cursor: next_cursor,
            keys: matching[start..end].iter().map(|key| key.to_string()).collect(),
        })
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.read(|keyspace| Ok(keyspace.hash(key)?.cloned().unwrap_or_default()))
    }

    async fn hash_get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.read(|keyspace| {
            let hash = keyspace.hash(key)?;
            Ok(fields
                .iter()
                .map(|field| hash.and_then(|h| h.get(field).cloned()))
                .collect())
        })
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let command = StoreCommand::zrangebyscore(key, min, max, limit);
        self.read(|keyspace| Ok(keyspace.execute(&command, Instant::now())?.into_members()))
    }

    async fn key_count(&self) -> StoreResult<u64> {
        self.read(|keyspace| Ok(keyspace.entries.len() as u64))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_store() -> MemoryEventStore {
        let store = MemoryEventStore::new();
        store.connect().await.unwrap();
        store
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("bot:*:stats", "bot:EzioBot:stats"));
        assert!(glob_match("bot:*:stats", "bot:a:b:stats"));
        assert!(!glob_match("bot:*:stats", "bot:EzioBot:hourly:2024-01-01T10"));
        assert!(glob_match("channel:?:activity", "channel:7:activity"));
        assert!(!glob_match("channel:?:activity", "channel:77:activity"));
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let store = MemoryEventStore::new();
        assert_eq!(
            store.hash_get_all("bot:a:stats").await.unwrap_err(),
            StoreError::NotConnected
        );
        store.connect().await.unwrap();
        store.connect().await.unwrap();
        assert_eq!(store.stats().connects, 1);
        assert!(store.hash_get_all("bot:a:stats").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_everything() {
        let store = connected_store().await;
        store.set_available(false);
        assert!(!store.is_connected());
        assert!(matches!(
            store.ping().await,
            Err(StoreError::ConnectionError(_))
        ));
        assert!(store.pipeline(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_pipeline_reports_per_command_outcomes() {
        let store = connected_store().await;
        store.fail_commands_matching("channel:");
        let replies = store
            .pipeline(&[
                StoreCommand::hincrby("bot:a:stats", "total_triggers", 2),
                StoreCommand::hincrby("channel:1:activity", "bot_triggers", 1),
                StoreCommand::hgetall("bot:a:stats"),
            ])
            .await
            .unwrap();

        assert_eq!(replies[0], Ok(StoreValue::Integer(2)));
        assert!(replies[1].is_err());
        let stats = replies[2].clone().unwrap().into_hash();
        assert_eq!(stats.get("total_triggers").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = connected_store().await;
        store
            .pipeline(&[StoreCommand::zadd("bot:a:perf", 1.0, "10:t1")])
            .await
            .unwrap();
        assert!(store.hash_get_all("bot:a:perf").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_disappear() {
        let store = connected_store().await;
        store
            .pipeline(&[
                StoreCommand::hset("trigger:event:t1", "data", "{}"),
                StoreCommand::expire("trigger:event:t1", 60),
            ])
            .await
            .unwrap();
        assert_eq!(store.ttl("trigger:event:t1"), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_range_with_limit() {
        let store = connected_store().await;
        store
            .pipeline(&[
                StoreCommand::zadd("bot:a:perf", 30.0, "300:t3"),
                StoreCommand::zadd("bot:a:perf", 10.0, "100:t1"),
                StoreCommand::zadd("bot:a:perf", 20.0, "200:t2"),
            ])
            .await
            .unwrap();

        let all = store
            .sorted_set_range_by_score("bot:a:perf", 0.0, 100.0, None)
            .await
            .unwrap();
        assert_eq!(all, vec!["100:t1", "200:t2", "300:t3"]);

        let window = store
            .sorted_set_range_by_score("bot:a:perf", 15.0, 30.0, Some(1))
            .await
            .unwrap();
        assert_eq!(window, vec!["200:t2"]);
    }

    #[tokio::test]
    async fn test_script_disabled_reports_script_error() {
        let store = connected_store().await;
        store.set_scripting(false);
        let result = store.run_script(StoreScript::TrackTrigger, &[], &[]).await;
        assert!(matches!(result, Err(StoreError::ScriptError(_))));
        assert_eq!(store.stats().scripts, 1);
    }
}
