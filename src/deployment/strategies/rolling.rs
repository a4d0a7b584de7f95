//! Rolling: replace instances in batches bounded by `max_unavailable` and
//! `max_surge`, pausing between batches, within a progress deadline that does
//! not count time spent paused.

use crate::deployment::execution::ExecutionContext;
use crate::deployment::rollback::AppliedChange;
use crate::deployment::target::TargetInstance;
use crate::deployment::types::RollingSettings;
use crate::error::{OrchestratorError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

struct ProgressDeadline {
    started: Instant,
    limit: Duration,
}

impl ProgressDeadline {
    fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Active time left, excluding pauses; `None` once exhausted
    fn remaining(&self, paused: Duration) -> Option<Duration> {
        let active = self.started.elapsed().saturating_sub(paused);
        self.limit.checked_sub(active).filter(|d| !d.is_zero())
    }
}

fn deadline_exceeded(
    ctx: &ExecutionContext,
    settings: &RollingSettings,
    replaced: usize,
    total: usize,
) -> OrchestratorError {
    OrchestratorError::strategy(
        ctx.deployment_id(),
        format!(
            "progress deadline of {}s exceeded after replacing {replaced}/{total} instances",
            settings.progress_deadline_seconds
        ),
    )
}

/// Run a target call bounded by the remaining progress deadline
async fn within<T>(
    ctx: &ExecutionContext,
    deadline: &ProgressDeadline,
    settings: &RollingSettings,
    progress: (usize, usize),
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    let remaining = deadline
        .remaining(ctx.paused_total())
        .ok_or_else(|| deadline_exceeded(ctx, settings, progress.0, progress.1))?;
    match tokio::time::timeout(remaining, call).await {
        Ok(result) => result,
        Err(_) => Err(deadline_exceeded(ctx, settings, progress.0, progress.1)),
    }
}

pub(crate) async fn execute(ctx: &mut ExecutionContext, settings: &RollingSettings) -> Result<()> {
    let environment = ctx.config().environment.clone();
    let artifact = ctx.config().artifact.clone();
    let target = ctx.target();
    let deadline = ProgressDeadline::new(settings.progress_deadline());

    let instances = within(
        ctx,
        &deadline,
        settings,
        (0, 0),
        target.list_instances(&environment),
    )
    .await?;

    if instances.is_empty() {
        ctx.checkpoint().await?;
        let ids = within(
            ctx,
            &deadline,
            settings,
            (0, settings.replicas as usize),
            target.launch_instances(&environment, &artifact, settings.replicas),
        )
        .await?;
        ctx.log(format!("launched {} fresh instance(s) of {artifact}", ids.len()));
        ctx.record_change(AppliedChange::InstancesLaunched {
            artifact: artifact.clone(),
            ids,
        });
        ctx.set_progress(90.0);
        return Ok(());
    }

    let old: Vec<TargetInstance> = instances
        .into_iter()
        .filter(|instance| instance.artifact != artifact)
        .collect();
    if old.is_empty() {
        ctx.log(format!("all instances already run {artifact}"));
        ctx.set_progress(90.0);
        return Ok(());
    }

    let total = old.len();
    let batch_len = settings.batch_len().max(1) as usize;
    let batch_count = total.div_ceil(batch_len);
    let pause = Duration::from_millis(settings.pause_between_batches_ms);
    let mut replaced = 0usize;

    for (batch_index, batch) in old.chunks(batch_len).enumerate() {
        ctx.checkpoint().await?;
        let progress = (replaced, total);
        let size = batch.len() as u32;
        let surge = settings.max_surge.min(size);

        if surge > 0 {
            let ids = within(
                ctx,
                &deadline,
                settings,
                progress,
                target.launch_instances(&environment, &artifact, surge),
            )
            .await?;
            ctx.record_change(AppliedChange::InstancesLaunched {
                artifact: artifact.clone(),
                ids,
            });
        }

        let ids: Vec<String> = batch.iter().map(|i| i.id.clone()).collect();
        within(
            ctx,
            &deadline,
            settings,
            progress,
            target.terminate_instances(&environment, &ids),
        )
        .await?;
        let mut by_artifact: BTreeMap<&str, u32> = BTreeMap::new();
        for instance in batch {
            *by_artifact.entry(instance.artifact.as_str()).or_insert(0) += 1;
        }
        for (old_artifact, count) in by_artifact {
            ctx.record_change(AppliedChange::InstancesTerminated {
                artifact: old_artifact.to_string(),
                count,
            });
        }
        ctx.note_unavailable(size - surge);

        let replacements = size - surge;
        if replacements > 0 {
            let ids = within(
                ctx,
                &deadline,
                settings,
                progress,
                target.launch_instances(&environment, &artifact, replacements),
            )
            .await?;
            ctx.record_change(AppliedChange::InstancesLaunched {
                artifact: artifact.clone(),
                ids,
            });
        }

        replaced += batch.len();
        ctx.set_progress(90.0 * replaced as f64 / total as f64);
        info!(
            deployment_id = %ctx.deployment_id(),
            batch = batch_index + 1,
            batches = batch_count,
            replaced = replaced,
            total = total,
            "🔄 Rolling batch completed"
        );
        ctx.log(format!(
            "batch {}/{batch_count}: replaced {} instance(s)",
            batch_index + 1,
            batch.len()
        ));

        if batch_index + 1 < batch_count {
            if deadline.remaining(ctx.paused_total()).is_none() {
                return Err(deadline_exceeded(ctx, settings, replaced, total));
            }
            ctx.sleep(pause).await?;
        }
    }

    Ok(())
}
