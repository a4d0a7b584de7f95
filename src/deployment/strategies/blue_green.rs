//! Blue-green: provision a parallel environment, validate it in isolation,
//! switch traffic (atomically or in cutover steps), then watch a warm-up window
//! and revert traffic on any metric breach.

use crate::deployment::execution::ExecutionContext;
use crate::deployment::rollback::AppliedChange;
use crate::deployment::types::{BlueGreenSettings, MetricThreshold, ObservedMetrics};
use crate::deployment::validation::CheckPhase;
use crate::error::{OrchestratorError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Slot the new artifact is provisioned into
pub const GREEN_SLOT: &str = "green";

pub(crate) async fn execute(ctx: &mut ExecutionContext, settings: &BlueGreenSettings) -> Result<()> {
    let environment = ctx.config().environment.clone();
    let artifact = ctx.config().artifact.clone();
    let deployment_id = ctx.deployment_id().to_string();

    ctx.checkpoint().await?;
    ctx.target()
        .provision_environment(&environment, GREEN_SLOT, &artifact)
        .await?;
    ctx.record_change(AppliedChange::EnvironmentProvisioned {
        slot: GREEN_SLOT.to_string(),
        artifact: artifact.clone(),
    });
    ctx.log(format!("provisioned {environment}/{GREEN_SLOT} with {artifact}"));
    ctx.set_progress(25.0);

    let slot_environment = format!("{environment}/{GREEN_SLOT}");
    let green = ctx
        .validation()
        .run_phases(
            ctx.config(),
            &slot_environment,
            &[CheckPhase::Smoke, CheckPhase::Health],
        )
        .await;
    if !green.success {
        return Err(OrchestratorError::strategy(
            deployment_id,
            format!("green environment failed validation: {}", green.message),
        ));
    }
    ctx.set_progress(40.0);

    let steps = cutover_plan(settings);
    let interval = Duration::from_millis(settings.step_interval_ms);
    for (index, percentage) in steps.iter().enumerate() {
        ctx.checkpoint().await?;
        ctx.shift_traffic(&artifact, *percentage).await?;
        ctx.set_progress(40.0 + 40.0 * (index + 1) as f64 / steps.len() as f64);
        if index + 1 < steps.len() {
            ctx.sleep(interval).await?;
        }
    }

    warm_up(ctx, settings).await?;
    ctx.set_progress(90.0);
    Ok(())
}

/// Cutover percentages, always ending at 100
fn cutover_plan(settings: &BlueGreenSettings) -> Vec<u8> {
    let mut steps = settings.cutover_steps.clone();
    if steps.last() != Some(&100) {
        steps.push(100);
    }
    steps
}

/// Thresholds violated by `metrics`; unobserved metrics are not breaches
pub(crate) fn breaches(thresholds: &[MetricThreshold], metrics: &ObservedMetrics) -> Vec<String> {
    thresholds
        .iter()
        .filter(|t| t.is_satisfied(metrics) == Some(false))
        .map(|t| match metrics.get(&t.metric) {
            Some(observed) => format!("{t} (observed {observed})"),
            None => t.to_string(),
        })
        .collect()
}

async fn warm_up(ctx: &mut ExecutionContext, settings: &BlueGreenSettings) -> Result<()> {
    if settings.warm_up_seconds == 0 || settings.thresholds.is_empty() {
        return Ok(());
    }

    let window = Duration::from_secs(settings.warm_up_seconds);
    let interval = Duration::from_millis(settings.warm_up_check_interval_ms);
    let started = Instant::now();
    loop {
        let remaining = window.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        ctx.sleep(interval.min(remaining)).await?;

        let metrics = ctx.observe().await?;
        let violated = breaches(&settings.thresholds, &metrics);
        if !violated.is_empty() {
            let artifact = ctx.config().artifact.clone();
            warn!(
                deployment_id = %ctx.deployment_id(),
                breaches = ?violated,
                "🔙 Warm-up breach, reverting traffic to the previous environment"
            );
            ctx.shift_traffic(&artifact, 0).await?;
            return Err(OrchestratorError::strategy(
                ctx.deployment_id(),
                format!(
                    "metric breach during warm-up, traffic reverted: {}",
                    violated.join(", ")
                ),
            ));
        }
    }
    ctx.log(format!("warm-up of {}s passed", settings.warm_up_seconds));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutover_plan_ends_at_full_traffic() {
        let atomic = BlueGreenSettings::default();
        assert_eq!(cutover_plan(&atomic), vec![100]);

        let gradual = BlueGreenSettings {
            cutover_steps: vec![25, 50],
            ..Default::default()
        };
        assert_eq!(cutover_plan(&gradual), vec![25, 50, 100]);
    }

    #[test]
    fn test_breaches_ignore_unobserved_metrics() {
        let thresholds = vec![
            MetricThreshold::below("error_rate", 0.05),
            MetricThreshold::below("response_time", 500.0),
        ];
        let metrics = ObservedMetrics::default().with_error_rate(0.2);
        let violated = breaches(&thresholds, &metrics);
        assert_eq!(violated, vec!["error_rate < 0.05 (observed 0.2)".to_string()]);
    }
}
