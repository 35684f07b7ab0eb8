//! # Write strategies
//!
//! Persisting one event is a single update across eight keys. [`ScriptWriter`]
//! sends it as one atomic server-side script. [`PipelineWriter`] sends the same
//! update as two pipelined rounds, which is not atomic across keys: a failed
//! command leaves the other keys updated, and the writer reports the partial
//! write instead of hiding it. [`FallbackWriter`] tries the first and falls
//! back to the second.

use crate::events::TriggerEvent;
use crate::store::{
    EventStore, StoreError, StoreResult, StoreScript, StoreValue, TrackTriggerArgs,
    TrackTriggerKeys, TrackTriggerPlan,
};
use crate::config::RetentionConfig;
use async_trait::async_trait;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Keys and arguments of one event write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWrite {
    pub keys: TrackTriggerKeys,
    pub args: TrackTriggerArgs,
}

impl PreparedWrite {
    /// Lay out a normalized event against the store's key space
    pub fn from_event(event: &TriggerEvent, retention: &RetentionConfig) -> StoreResult<Self> {
        let timestamp = event.timestamp().ok_or_else(|| {
            StoreError::UnexpectedReply(format!(
                "event {} has an unrepresentable timestamp {}",
                event.trigger_id, event.timestamp_ms
            ))
        })?;
        let event_json = serde_json::to_string(event)
            .map_err(|e| StoreError::backend("serialize_event", e))?;

        Ok(Self {
            keys: TrackTriggerKeys::new(
                &event.trigger_id,
                &event.bot_name,
                &event.channel_id,
                &event.user_id,
                timestamp,
            ),
            args: TrackTriggerArgs {
                event_json,
                timestamp_ms: event.timestamp_ms,
                response_time_ms: event.response_time_ms,
                success: event.success,
                condition_name: event.condition_name.clone(),
                bot_name: event.bot_name.clone(),
                user_id: event.user_id.clone(),
                channel_id: event.channel_id.clone(),
                guild_id: event.guild_id.clone(),
                trigger_id: event.trigger_id.clone(),
                response_type: event.response.label().to_string(),
                event_ttl_secs: retention.event_ttl_secs,
                hourly_ttl_secs: retention.hourly_ttl_secs,
                daily_ttl_secs: retention.daily_ttl_secs,
                activity_ttl_secs: retention.activity_ttl_secs,
                performance_ttl_secs: retention.performance_ttl_secs,
            },
        })
    }
}

/// One way of applying a [`PreparedWrite`] to the store
#[async_trait]
pub trait WriteStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn write(&self, store: &dyn EventStore, write: &PreparedWrite) -> StoreResult<()>;
}

/// Atomic path: one script call touching all eight keys
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptWriter;

#[async_trait]
impl WriteStrategy for ScriptWriter {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn write(&self, store: &dyn EventStore, write: &PreparedWrite) -> StoreResult<()> {
        store
            .run_script(
                StoreScript::TrackTrigger,
                &write.keys.to_vec(),
                &write.args.to_vec(),
            )
            .await
            .map(|_| ())
    }
}

/// Best-effort path: the same update as two pipelined rounds
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineWriter;

#[async_trait]
impl WriteStrategy for PipelineWriter {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    async fn write(&self, store: &dyn EventStore, write: &PreparedWrite) -> StoreResult<()> {
        let plan = TrackTriggerPlan::new(write.keys.clone(), write.args.clone());

        let first_replies = store.pipeline(plan.first_round()).await?;
        let mut failed = count_failures(&first_replies);
        let mut total = first_replies.len();

        let second_round = plan.second_round(&first_replies);
        if !second_round.is_empty() {
            let second_replies = store.pipeline(&second_round).await?;
            failed += count_failures(&second_replies);
            total += second_replies.len();
        }

        if failed > 0 {
            warn!(
                trigger_id = %write.args.trigger_id,
                bot_name = %write.args.bot_name,
                failed_commands = failed,
                total_commands = total,
                "Pipeline write partially applied"
            );
            return Err(StoreError::PartialWrite { failed, total });
        }
        Ok(())
    }
}

fn count_failures(replies: &[StoreResult<StoreValue>]) -> usize {
    replies.iter().filter(|reply| reply.is_err()).count()
}

/// Primary strategy with a fallback for non-connectivity failures
#[derive(Debug)]
pub struct FallbackWriter {
    primary: Box<dyn WriteStrategy>,
    fallback: Box<dyn WriteStrategy>,
}

impl Default for FallbackWriter {
    fn default() -> Self {
        Self::new(Box::new(ScriptWriter), Box::new(PipelineWriter))
    }
}

/// Which strategy ended up applying a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Primary,
    Fallback,
}

impl FallbackWriter {
    pub fn new(primary: Box<dyn WriteStrategy>, fallback: Box<dyn WriteStrategy>) -> Self {
        Self { primary, fallback }
    }

    /// Apply the write, falling back when the primary strategy fails for a
    /// reason other than an unreachable store.
    pub async fn write(
        &self,
        store: &dyn EventStore,
        write: &PreparedWrite,
    ) -> StoreResult<WritePath> {
        match self.primary.write(store, write).await {
            Ok(()) => Ok(WritePath::Primary),
            Err(error) if error.is_connectivity() => Err(error),
            Err(error) => {
                debug!(
                    trigger_id = %write.args.trigger_id,
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %error,
                    "Primary write failed, using fallback"
                );
                self.fallback.write(store, write).await?;
                Ok(WritePath::Fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{keys, MemoryEventStore};

    async fn connected_store() -> MemoryEventStore {
        let store = MemoryEventStore::new();
        store.connect().await.unwrap();
        store
    }

    fn sample_write() -> PreparedWrite {
        let event = TriggerEvent::new("EzioBot", "assassin", "u1", "c1", "m1")
            .with_trigger_id("t-1")
            .with_response_time_ms(100);
        PreparedWrite::from_event(&event, &RetentionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_script_and_pipeline_write_identical_state() {
        let write = sample_write();

        let scripted = connected_store().await;
        ScriptWriter.write(&scripted, &write).await.unwrap();

        let pipelined = connected_store().await;
        PipelineWriter.write(&pipelined, &write).await.unwrap();

        assert_eq!(scripted.keys(), pipelined.keys());
        for key in scripted.keys() {
            if key.ends_with(":perf") {
                continue;
            }
            assert_eq!(
                scripted.hash_get_all(&key).await.unwrap(),
                pipelined.hash_get_all(&key).await.unwrap(),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn test_fallback_used_when_scripting_unsupported() {
        let store = connected_store().await;
        store.set_scripting(false);

        let path = FallbackWriter::default()
            .write(&store, &sample_write())
            .await
            .unwrap();
        assert_eq!(path, WritePath::Fallback);

        let stats = store
            .hash_get_all(&keys::bot_stats("EzioBot"))
            .await
            .unwrap();
        assert_eq!(stats.get("total_triggers").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_no_fallback_when_store_unreachable() {
        let store = connected_store().await;
        store.set_available(false);

        let result = FallbackWriter::default().write(&store, &sample_write()).await;
        assert!(matches!(result, Err(StoreError::ConnectionError(_))));
        assert_eq!(store.stats().pipelines, 0);
    }

    #[tokio::test]
    async fn test_partial_pipeline_write_is_reported() {
        let store = connected_store().await;
        store.fail_commands_matching(":conditions");

        let result = PipelineWriter.write(&store, &sample_write()).await;
        assert!(matches!(result, Err(StoreError::PartialWrite { failed: 2, .. })));

        // Everything else still landed
        let stats = store
            .hash_get_all(&keys::bot_stats("EzioBot"))
            .await
            .unwrap();
        assert_eq!(stats.get("total_triggers").map(String::as_str), Some("1"));
    }
}
