//! # Deployment Orchestration
//!
//! Blue-green, canary and rolling rollouts against a [`DeploymentTarget`],
//! with pre/post validation, automatic and manual rollback, approval-gated
//! promotion between environments and per-deployment analytics.

pub mod analytics;
pub mod approval;
pub mod execution;
pub mod orchestrator;
pub mod promotion;
pub mod rollback;
pub mod strategies;
pub mod target;
pub mod types;
pub mod validation;

pub use analytics::{AnalyticsManager, AnalyticsSummary, DeploymentAnalytics, GroupBy};
pub use approval::{ApprovalDecision, ApprovalManager, ApprovalRequest, ApprovalStatus};
pub use execution::{ExecutionContext, ExecutionControl};
pub use orchestrator::DeploymentOrchestrator;
pub use promotion::{PromotionManager, PromotionStage};
pub use rollback::{RollbackManager, RollbackPlan, RollbackRecord, RollbackTrigger};
pub use strategies::{analyze_canary, CanaryAnalysis, CanaryRecommendation};
pub use target::{DeploymentTarget, InMemoryTarget};
pub use types::{
    DeploymentConfig, DeploymentFilter, DeploymentRecord, DeploymentResult, DeploymentStrategy,
    MetricThreshold, ObservedMetrics, PromotionResult,
};
pub use validation::{CheckPhase, CheckSpec, ValidationManager, ValidationResult};
