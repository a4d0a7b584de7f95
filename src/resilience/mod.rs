//! # Resilience Module
//!
//! Per-dependency circuit breakers that isolate failing collaborators.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orchestrator_core::resilience::{CircuitBreaker, CircuitBreakerSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CircuitBreakerSettings {
//!     failure_threshold: 3,
//!     timeout: Duration::from_secs(60),
//!     success_threshold: 1,
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("artifact_registry".to_string(), settings);
//!
//! let result = circuit_breaker.call(|| async {
//!     Ok::<&str, std::io::Error>("image published")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerError, CircuitBreakerState, CircuitState,
};
pub use config::CircuitBreakerSettings;
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
