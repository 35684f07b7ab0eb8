//! # Resilience Module
//!
//! Circuit breaking for every path that talks to the shared event store.
//!
//! The recorder and the exporter each own an independent [`CircuitBreaker`], so a
//! failing write path cannot disable the read path and vice versa.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trigger_metrics::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("event_store_writes".to_string(), CircuitBreakerConfig::for_recorder());
//!
//! let result = breaker
//!     .call(|| async { Ok::<&str, std::io::Error>("written") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
