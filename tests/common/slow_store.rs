//! Store wrapper that delays scans, to observe overlapping exports

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use trigger_metrics::store::{
    EventStore, MemoryEventStore, ScanPage, StoreCommand, StoreResult, StoreScript, StoreValue,
};

#[derive(Debug)]
pub struct SlowStore {
    inner: Arc<MemoryEventStore>,
    scan_delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<MemoryEventStore>, scan_delay: Duration) -> Self {
        Self { inner, scan_delay }
    }
}

#[async_trait]
impl EventStore for SlowStore {
    async fn connect(&self) -> StoreResult<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn ping(&self) -> StoreResult<Duration> {
        self.inner.ping().await
    }

    async fn run_script(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<StoreValue> {
        self.inner.run_script(script, keys, args).await
    }

    async fn pipeline(&self, commands: &[StoreCommand]) -> StoreResult<Vec<StoreResult<StoreValue>>> {
        self.inner.pipeline(commands).await
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage> {
        tokio::time::sleep(self.scan_delay).await;
        self.inner.scan(pattern, cursor, count).await
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hash_get_all(key).await
    }

    async fn hash_get_fields(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.inner.hash_get_fields(key, fields).await
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.inner.sorted_set_range_by_score(key, min, max, limit).await
    }

    async fn key_count(&self) -> StoreResult<u64> {
        self.inner.key_count().await
    }

    fn provider_name(&self) -> &'static str {
        "slow-memory"
    }
}
