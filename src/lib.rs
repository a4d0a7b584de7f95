#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Orchestrator Core
//!
//! The orchestration core of an automation platform: it sequences work
//! requests under priority and failure constraints, executes multi-stage
//! deployments with validation and rollback, and right-sizes and routes
//! traffic across running instances.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Priority work queue, retry with backoff, and the [`OrchestrationCore`] facade
//! - [`deployment`] - Blue-green, canary and rolling strategies, validation, rollback, approvals, promotion, analytics
//! - [`scaling`] - Auto-scaling policies, load balancing and health checking
//! - [`resilience`] - Per-dependency circuit breakers
//! - [`events`] - Append-only event store with typed subscriptions
//! - [`state_machine`] - Deployment lifecycle transitions
//! - [`config`] - Layered YAML and environment configuration
//! - [`error`] - Structured errors with machine-readable categories
//! - [`logging`] - Structured logging setup and helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orchestrator_core::orchestration::{OrchestrationCore, WorkKind, WorkRequest};
//! use serde_json::json;
//!
//! # async fn example() -> orchestrator_core::Result<()> {
//! let core = OrchestrationCore::new()?;
//! core.start()?;
//!
//! let ticket = core.submit_work_request(WorkRequest::new(
//!     WorkKind::Deployment,
//!     json!({"strategy": "rolling", "environment": "staging", "artifact": "api:2"}),
//! ))?;
//! let result = ticket.wait().await?;
//! println!("deployment accepted: {}", result.success);
//!
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod deployment;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestration;
pub mod resilience;
pub mod scaling;
pub mod state_machine;

pub use config::{ConfigManager, OrchestratorConfig};
pub use constants::{events as event_types, system};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use events::{EventFilter, EventStore, SystemEvent};
pub use orchestration::OrchestrationCore;
