//! # Orchestration
//!
//! Work intake and the top-level facade.
//!
//! - **WorkflowOrchestrator**: tiered priority queue, retry with backoff,
//!   per-dependency circuit breaking and load shedding
//! - **WorkHandler**: collaborator boundary per work kind; deployment requests
//!   are delegated to the deployment orchestrator
//! - **OrchestrationCore**: wires every subsystem from configuration and
//!   exposes the public operations

pub mod backoff_calculator;
pub mod core;
pub mod handlers;
pub mod priority_queue;
pub mod types;
pub mod workflow_orchestrator;

pub use backoff_calculator::BackoffCalculator;
pub use self::core::{CoreCollaborators, OrchestrationCore};
pub use handlers::{DeploymentWorkHandler, FnWorkHandler, HandlerRegistry, WorkHandler};
pub use priority_queue::PriorityQueue;
pub use types::{
    QueueStatus, WorkKind, WorkMetrics, WorkPriority, WorkRequest, WorkResult, WorkTicket,
};
pub use workflow_orchestrator::WorkflowOrchestrator;
