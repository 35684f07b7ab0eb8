//! Event store providers

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::{MemoryEventStore, MemoryStoreStats};
#[cfg(feature = "redis-store")]
pub use self::redis::RedisEventStore;
