//! Rollout algorithms, one execution function per [`DeploymentStrategy`] variant.

pub mod blue_green;
pub mod canary;
pub mod rolling;

pub use canary::{analyze_canary, CanaryAnalysis, CanaryRecommendation};

use super::execution::ExecutionContext;
use super::types::DeploymentStrategy;
use crate::error::Result;

/// Run the strategy to completion, honoring pause and cancellation
pub(crate) async fn execute_strategy(
    ctx: &mut ExecutionContext,
    strategy: &DeploymentStrategy,
) -> Result<()> {
    match strategy {
        DeploymentStrategy::BlueGreen(settings) => blue_green::execute(ctx, settings).await,
        DeploymentStrategy::Canary(settings) => canary::execute(ctx, settings).await,
        DeploymentStrategy::Rolling(settings) => rolling::execute(ctx, settings).await,
    }
}
