//! Error types for the orchestration core.
//!
//! Every failure maps onto an [`ErrorCategory`] so callers can branch on a
//! machine-readable category while still getting a human-readable message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable failure categories surfaced by every public operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or unsupported configuration; nothing was attempted
    Validation,
    /// Recoverable failure calling a downstream collaborator
    TransientDependency,
    /// Call short-circuited by an open breaker; nothing was attempted
    CircuitOpen,
    /// Request shed because the queue is saturated
    Overload,
    /// A deployment strategy could not complete
    StrategyExecution,
    /// Rollback itself failed; most severe, no further automatic action
    RollbackFailure,
    /// A single instance failed its health checks
    HealthCheck,
    /// Referenced entity does not exist
    NotFound,
    /// Operation is not permitted in the entity's current state
    InvalidState,
    /// Configuration could not be loaded or is inconsistent
    Configuration,
}

impl ErrorCategory {
    /// Severity rank, higher is worse
    pub fn severity(&self) -> u8 {
        match self {
            Self::HealthCheck => 1,
            Self::NotFound | Self::InvalidState => 2,
            Self::Validation | Self::Configuration => 3,
            Self::Overload => 4,
            Self::TransientDependency | Self::CircuitOpen => 5,
            Self::StrategyExecution => 7,
            Self::RollbackFailure => 10,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::TransientDependency => "transient_dependency",
            Self::CircuitOpen => "circuit_open",
            Self::Overload => "overload",
            Self::StrategyExecution => "strategy_execution",
            Self::RollbackFailure => "rollback_failure",
            Self::HealthCheck => "health_check",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::Configuration => "configuration",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient failure calling {dependency}: {message}")]
    TransientDependency { dependency: String, message: String },

    /// Permanent collaborator failure; never retried
    #[error("Dependency {dependency} failed permanently: {message}")]
    PermanentDependency { dependency: String, message: String },

    #[error("Retries exhausted for {dependency} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        dependency: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Circuit breaker open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Queue overloaded ({queue_depth}/{limit}); {priority} request rejected")]
    Overload {
        queue_depth: usize,
        limit: usize,
        priority: String,
    },

    #[error("Strategy execution failed for deployment {deployment_id}: {message}")]
    StrategyExecution {
        deployment_id: String,
        message: String,
    },

    #[error("Rollback failed for deployment {deployment_id}: {message}")]
    RollbackFailure {
        deployment_id: String,
        message: String,
    },

    #[error("Health check failed for instance {instance_id}: {message}")]
    HealthCheck {
        instance_id: String,
        message: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid transition from {from} via {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Work stopped on request (shutdown, manual rollback); not a failure of the work itself
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn permanent(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn strategy(deployment_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StrategyExecution {
            deployment_id: deployment_id.into(),
            message: message.into(),
        }
    }

    /// Category used in structured results and audit events
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::TransientDependency { .. }
            | Self::PermanentDependency { .. }
            | Self::RetriesExhausted { .. }
            | Self::Timeout { .. } => ErrorCategory::TransientDependency,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::Overload { .. } => ErrorCategory::Overload,
            Self::StrategyExecution { .. } => ErrorCategory::StrategyExecution,
            Self::RollbackFailure { .. } => ErrorCategory::RollbackFailure,
            Self::HealthCheck { .. } => ErrorCategory::HealthCheck,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidState(_) | Self::InvalidTransition { .. } | Self::Cancelled(_) => {
                ErrorCategory::InvalidState
            }
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether the retry loop should attempt the call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDependency { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the failure counts against the dependency's circuit breaker
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientDependency { .. }
                | Self::PermanentDependency { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(error: serde_json::Error) -> Self {
        OrchestratorError::Validation(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::config::ConfigurationError> for OrchestratorError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        OrchestratorError::Configuration(error.to_string())
    }
}

/// Structured failure description attached to result types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&OrchestratorError> for ErrorInfo {
    fn from(error: &OrchestratorError) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
