//! Canary: shift traffic through ordered stages, analysing thresholds during
//! and at the end of each stage before promoting to the next.

use crate::deployment::execution::ExecutionContext;
use crate::deployment::types::{CanarySettings, CanaryStage, ObservedMetrics};
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanaryRecommendation {
    /// Stage passed; advance (or finalize after the last stage)
    Promote,
    /// Keep observing; only produced before the stage ends
    Continue,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryAnalysis {
    pub recommendation: CanaryRecommendation,
    pub violations: Vec<String>,
    /// Threshold metrics that were not observed
    pub missing: Vec<String>,
}

/// Evaluate a stage's thresholds against observed metrics
///
/// Any violation recommends rollback. Missing metrics are tolerated while the
/// stage is still running but block promotion once it ends.
pub fn analyze_canary(
    stage: &CanaryStage,
    metrics: &ObservedMetrics,
    stage_complete: bool,
) -> CanaryAnalysis {
    let mut violations = Vec::new();
    let mut missing = Vec::new();
    for threshold in &stage.thresholds {
        match threshold.is_satisfied(metrics) {
            Some(true) => {}
            Some(false) => violations.push(threshold.to_string()),
            None => missing.push(threshold.metric.clone()),
        }
    }

    let recommendation = if !violations.is_empty() || (stage_complete && !missing.is_empty()) {
        CanaryRecommendation::Rollback
    } else if stage_complete {
        CanaryRecommendation::Promote
    } else {
        CanaryRecommendation::Continue
    };

    CanaryAnalysis {
        recommendation,
        violations,
        missing,
    }
}

pub(crate) async fn execute(ctx: &mut ExecutionContext, settings: &CanarySettings) -> Result<()> {
    let artifact = ctx.config().artifact.clone();
    let stage_count = settings.stages.len();

    for (index, stage) in settings.stages.iter().enumerate() {
        ctx.checkpoint().await?;
        ctx.shift_traffic(&artifact, stage.percentage).await?;
        info!(
            deployment_id = %ctx.deployment_id(),
            stage = index + 1,
            stages = stage_count,
            percentage = stage.percentage,
            "🐤 Canary stage started"
        );

        observe_stage(ctx, settings, index, stage).await?;

        let metrics = ctx.observe().await?;
        let analysis = analyze_canary(stage, &metrics, true);
        if analysis.recommendation != CanaryRecommendation::Promote {
            return Err(stage_failure(ctx, index, &analysis));
        }
        ctx.stage_completed(index, stage.percentage);
        ctx.set_progress(90.0 * (index + 1) as f64 / stage_count as f64);

        if !settings.auto_promote && index + 1 < stage_count {
            ctx.request_pause(&format!(
                "canary stage {} passed; awaiting promotion",
                index + 1
            ))?;
        }
    }

    if settings.stages.last().map(|s| s.percentage) != Some(100) {
        ctx.checkpoint().await?;
        ctx.shift_traffic(&artifact, 100).await?;
    }
    ctx.log("canary finalized at 100%");
    Ok(())
}

/// Wait out the stage, analysing continuously when an interval is configured
async fn observe_stage(
    ctx: &mut ExecutionContext,
    settings: &CanarySettings,
    index: usize,
    stage: &CanaryStage,
) -> Result<()> {
    let duration = Duration::from_secs(stage.duration_seconds);
    let Some(interval_ms) = settings.analysis_interval_ms else {
        return ctx.sleep(duration).await;
    };

    let interval = Duration::from_millis(interval_ms);
    let started = Instant::now();
    loop {
        let remaining = duration.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(());
        }
        ctx.sleep(interval.min(remaining)).await?;
        if started.elapsed() >= duration {
            // Stage-end analysis follows
            return Ok(());
        }

        let metrics = ctx.observe().await?;
        let analysis = analyze_canary(stage, &metrics, false);
        if analysis.recommendation == CanaryRecommendation::Rollback {
            return Err(stage_failure(ctx, index, &analysis));
        }
    }
}

fn stage_failure(
    ctx: &ExecutionContext,
    index: usize,
    analysis: &CanaryAnalysis,
) -> OrchestratorError {
    let mut reasons = analysis.violations.clone();
    reasons.extend(analysis.missing.iter().map(|m| format!("{m} not observed")));
    ctx.warn(format!(
        "canary stage {} recommends rollback: {}",
        index + 1,
        reasons.join(", ")
    ));
    OrchestratorError::strategy(
        ctx.deployment_id(),
        format!(
            "canary stage {} failed analysis: {}",
            index + 1,
            reasons.join(", ")
        ),
    )
}
