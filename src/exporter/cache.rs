//! Snapshot cache with TTL reads and a retention sweep

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cache key of the full exposition snapshot
pub const SNAPSHOT_KEY: &str = "prometheus_snapshot";

/// One rendered snapshot
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub text: String,
    pub computed_at: Instant,
    pub computed_at_wall: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.computed_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

/// Rendered snapshots keyed by name
#[derive(Debug)]
pub struct SnapshotCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    retention: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            retention: retention.max(ttl),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A snapshot younger than the TTL, counted as a hit; a miss is counted otherwise
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, age_ms = entry.age().as_millis() as u64, "Snapshot cache hit");
                Some(entry.text.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Snapshot cache miss");
                None
            }
        }
    }

    /// The stored snapshot regardless of age, without touching the counters
    pub fn latest(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn insert(&self, key: impl Into<String>, text: String) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                text,
                computed_at: Instant::now(),
                computed_at_wall: Utc::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Evict entries older than the retention window; returns how many
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries.retain(|_, entry| entry.age() < retention);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Fraction of lookups served from the cache, 0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_reads_follow_ttl() {
        let cache = SnapshotCache::new(Duration::from_secs(15), Duration::from_secs(300));
        assert!(cache.get_fresh(SNAPSHOT_KEY).is_none());

        cache.insert(SNAPSHOT_KEY, "up 1\n".to_string());
        assert_eq!(cache.get_fresh(SNAPSHOT_KEY).as_deref(), Some("up 1\n"));

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(cache.get_fresh(SNAPSHOT_KEY).is_none());
        assert!(cache.latest(SNAPSHOT_KEY).is_some());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
        assert!((cache.hit_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_past_retention() {
        let cache = SnapshotCache::new(Duration::from_secs(15), Duration::from_secs(60));
        cache.insert("old", String::new());
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.insert("new", String::new());
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.sweep(), 1);
        assert!(cache.latest("old").is_none());
        assert!(cache.latest("new").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }
}
