//! Fixtures shared by the integration tests

use std::sync::Arc;
use trigger_metrics::config::{CircuitBreakerSettings, ExporterConfig, RecorderConfig, WriteMode};
use trigger_metrics::events::TriggerEvent;
use trigger_metrics::recorder::TriggerEventRecorder;
use trigger_metrics::store::MemoryEventStore;

/// Builder for trigger events with sensible test defaults
pub struct TriggerEventBuilder {
    bot_name: String,
    condition_name: String,
    user_id: String,
    channel_id: String,
    guild_id: Option<String>,
    response_time_ms: u64,
    error: Option<String>,
    trigger_id: Option<String>,
}

impl TriggerEventBuilder {
    pub fn new(bot_name: &str) -> Self {
        Self {
            bot_name: bot_name.to_string(),
            condition_name: "default".to_string(),
            user_id: "user-1".to_string(),
            channel_id: "channel-1".to_string(),
            guild_id: None,
            response_time_ms: 100,
            error: None,
            trigger_id: None,
        }
    }

    pub fn condition(mut self, condition_name: &str) -> Self {
        self.condition_name = condition_name.to_string();
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    pub fn channel(mut self, channel_id: &str) -> Self {
        self.channel_id = channel_id.to_string();
        self
    }

    pub fn guild(mut self, guild_id: &str) -> Self {
        self.guild_id = Some(guild_id.to_string());
        self
    }

    pub fn response_time(mut self, response_time_ms: u64) -> Self {
        self.response_time_ms = response_time_ms;
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn id(mut self, trigger_id: &str) -> Self {
        self.trigger_id = Some(trigger_id.to_string());
        self
    }

    pub fn build(self) -> TriggerEvent {
        let mut event = TriggerEvent::new(
            &self.bot_name,
            &self.condition_name,
            &self.user_id,
            &self.channel_id,
            "message-1",
        )
        .with_response_time_ms(self.response_time_ms);
        if let Some(guild_id) = self.guild_id {
            event = event.with_guild(guild_id);
        }
        if let Some(error) = self.error {
            event = event.failed(error);
        }
        if let Some(trigger_id) = self.trigger_id {
            event = event.with_trigger_id(trigger_id);
        }
        event
    }
}

pub fn event(bot_name: &str) -> TriggerEventBuilder {
    TriggerEventBuilder::new(bot_name)
}

/// Direct-mode recorder with a breaker that reopens after `reset_timeout_ms`
pub fn direct_config(reset_timeout_ms: u64) -> RecorderConfig {
    RecorderConfig {
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: 5,
            reset_timeout_ms,
        },
        ..RecorderConfig::direct()
    }
}

pub fn batched_config(batch_size: usize, batch_flush_interval_ms: u64) -> RecorderConfig {
    RecorderConfig {
        mode: WriteMode::Batched,
        batch_size,
        batch_flush_interval_ms,
        ..RecorderConfig::default()
    }
}

pub fn exporter_config(cache_ttl_ms: u64) -> ExporterConfig {
    ExporterConfig {
        cache_ttl_ms,
        ..ExporterConfig::default()
    }
}

/// A recorder over a fresh memory store
pub fn recorder(config: RecorderConfig) -> (Arc<MemoryEventStore>, Arc<TriggerEventRecorder>) {
    let store = Arc::new(MemoryEventStore::new());
    let recorder = TriggerEventRecorder::new(store.clone(), config)
        .expect("recorder configuration should be valid");
    (store, Arc::new(recorder))
}
