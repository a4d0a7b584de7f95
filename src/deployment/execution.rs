//! # Deployment Execution
//!
//! Per-deployment runtime state and the context strategies execute in.
//!
//! Each deployment owns one [`DeploymentEntry`]: its record and state machine
//! behind a single lock (one transition at a time), a control channel for
//! pause/resume/cancel, and a status channel for completion waiters. Strategies
//! only see an [`ExecutionContext`], which records every applied change so a
//! rollback plan can be derived from it.

use super::rollback::AppliedChange;
use super::target::DeploymentTarget;
use super::types::{
    DeploymentConfig, DeploymentRecord, DeploymentStrategy, LogLevel, ObservedMetrics,
};
use super::validation::ValidationManager;
use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::EventStore;
use crate::state_machine::{DeploymentEvent, DeploymentStateMachine, DeploymentStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Operator control over a running deployment task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionControl {
    Running,
    Paused,
    Cancelled,
}

struct EntryState {
    record: DeploymentRecord,
    machine: DeploymentStateMachine,
    changes: Vec<AppliedChange>,
}

/// Runtime state of one deployment
pub(crate) struct DeploymentEntry {
    pub(crate) config: DeploymentConfig,
    /// `None` when the configured strategy was rejected
    pub(crate) strategy: Option<DeploymentStrategy>,
    state: Mutex<EntryState>,
    control: watch::Sender<ExecutionControl>,
    status: watch::Sender<DeploymentStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
    rolling_back: AtomicBool,
    started: Instant,
}

impl std::fmt::Debug for DeploymentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentEntry")
            .field("id", &self.config.id)
            .field("status", &self.status())
            .finish()
    }
}

impl DeploymentEntry {
    pub(crate) fn new(
        config: DeploymentConfig,
        strategy: Option<DeploymentStrategy>,
        events: EventStore,
    ) -> Self {
        let pausable = strategy.as_ref().is_some_and(DeploymentStrategy::is_pausable);
        let machine = DeploymentStateMachine::new(config.id.clone(), pausable, events);
        let record = DeploymentRecord::new(&config);
        let (control, _) = watch::channel(ExecutionControl::Running);
        let (status, _) = watch::channel(DeploymentStatus::Pending);

        Self {
            config,
            strategy,
            state: Mutex::new(EntryState {
                record,
                machine,
                changes: Vec::new(),
            }),
            control,
            status,
            task: Mutex::new(None),
            rolling_back: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.config.id
    }

    pub(crate) fn status(&self) -> DeploymentStatus {
        *self.status.borrow()
    }

    pub(crate) fn snapshot(&self) -> DeploymentRecord {
        self.state.lock().record.clone()
    }

    /// Apply a lifecycle event; the record mirrors the machine afterwards
    pub(crate) fn transition(&self, event: DeploymentEvent) -> Result<DeploymentStatus> {
        self.transition_with(event, |_| {})
    }

    /// Like [`Self::transition`], running `on_terminal` with the final record
    /// before completion waiters are released
    pub(crate) fn transition_with(
        &self,
        event: DeploymentEvent,
        on_terminal: impl FnOnce(&DeploymentRecord),
    ) -> Result<DeploymentStatus> {
        let mut state = self.state.lock();
        let from = state.machine.current_state();
        let to = state.machine.transition(event)?;

        let now = Utc::now();
        if let Some(last) = state.machine.transitions().last().cloned() {
            state.record.transitions.push(last);
        }
        state.record.status = to;
        if to.is_terminal() {
            state.record.completed_at = Some(now);
            state.record.metrics.duration_ms = self.started.elapsed().as_millis() as u64;
        }
        let level = if to == DeploymentStatus::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        state.record.log(level, format!("status {from} -> {to}"));
        if to.is_terminal() {
            on_terminal(&state.record);
        }
        drop(state);

        self.status.send_replace(to);
        Ok(to)
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.state.lock().record.log(level, message);
    }

    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut DeploymentRecord) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state.record);
        state.record.updated_at = Utc::now();
        result
    }

    pub(crate) fn record_change(&self, change: AppliedChange) {
        let mut state = self.state.lock();
        match &change {
            AppliedChange::InstancesLaunched { ids, .. } => {
                state.record.metrics.instances_launched += ids.len() as u32;
            }
            AppliedChange::InstancesTerminated { count, .. } => {
                state.record.metrics.instances_terminated += count;
            }
            AppliedChange::TrafficShifted { to, .. } => {
                state.record.metrics.traffic_percentage = *to;
            }
            AppliedChange::EnvironmentProvisioned { .. } => {}
        }
        state.changes.push(change);
    }

    pub(crate) fn changes(&self) -> Vec<AppliedChange> {
        self.state.lock().changes.clone()
    }

    pub(crate) fn control(&self) -> ExecutionControl {
        *self.control.borrow()
    }

    pub(crate) fn set_control(&self, control: ExecutionControl) {
        self.control.send_replace(control);
    }

    pub(crate) fn subscribe_control(&self) -> watch::Receiver<ExecutionControl> {
        self.control.subscribe()
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<DeploymentStatus> {
        self.status.subscribe()
    }

    /// Pause through the state machine, then hold the task at its next checkpoint
    pub(crate) fn pause(&self, reason: &str) -> Result<()> {
        self.transition(DeploymentEvent::Pause)?;
        self.log(LogLevel::Info, format!("paused: {reason}"));
        self.set_control(ExecutionControl::Paused);
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.transition(DeploymentEvent::Resume)?;
        self.log(LogLevel::Info, "resumed");
        self.set_control(ExecutionControl::Running);
        Ok(())
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Claim the right to roll back; false when a rollback is already running
    pub(crate) fn try_begin_rollback(&self) -> bool {
        self.rolling_back
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_rollback(&self) {
        self.rolling_back.store(false, Ordering::Release);
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// What a strategy sees while it runs
pub struct ExecutionContext {
    entry: Arc<DeploymentEntry>,
    target: Arc<dyn DeploymentTarget>,
    validation: Arc<ValidationManager>,
    events: EventStore,
    control: watch::Receiver<ExecutionControl>,
    paused_total: Duration,
}

impl ExecutionContext {
    pub(crate) fn new(
        entry: Arc<DeploymentEntry>,
        target: Arc<dyn DeploymentTarget>,
        validation: Arc<ValidationManager>,
        events: EventStore,
    ) -> Self {
        let control = entry.subscribe_control();
        Self {
            entry,
            target,
            validation,
            events,
            control,
            paused_total: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.entry.config
    }

    pub fn deployment_id(&self) -> &str {
        self.entry.id()
    }

    pub fn target(&self) -> Arc<dyn DeploymentTarget> {
        Arc::clone(&self.target)
    }

    pub fn validation(&self) -> &ValidationManager {
        &self.validation
    }

    /// Total time spent paused so far
    pub fn paused_total(&self) -> Duration {
        self.paused_total
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(deployment_id = %self.deployment_id(), "{message}");
        self.entry.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.entry.log(LogLevel::Warn, message);
    }

    pub fn record_change(&self, change: AppliedChange) {
        self.entry.record_change(change);
    }

    pub fn set_progress(&self, progress: f64) {
        self.entry
            .with_record(|record| record.progress = progress.clamp(0.0, 100.0));
    }

    /// Largest number of instances observed unavailable at once
    pub fn note_unavailable(&self, unavailable: u32) {
        self.entry.with_record(|record| {
            record.metrics.max_unavailable_observed =
                record.metrics.max_unavailable_observed.max(unavailable);
        });
    }

    /// Route `percentage` of traffic to `artifact` and record the shift
    pub async fn shift_traffic(&self, artifact: &str, percentage: u8) -> Result<()> {
        let from = self
            .entry
            .with_record(|record| record.metrics.traffic_percentage);
        self.target
            .set_traffic_split(&self.config().environment, artifact, percentage)
            .await?;
        self.record_change(AppliedChange::TrafficShifted {
            artifact: artifact.to_string(),
            from,
            to: percentage,
        });
        self.log(format!("traffic to {artifact}: {from}% -> {percentage}%"));

        self.events.append(
            events::DEPLOYMENT_TRAFFIC_SHIFTED,
            Some(self.deployment_id()),
            json!({ "artifact": artifact, "from": from, "to": percentage }),
        );
        Ok(())
    }

    /// Observe metrics for the new artifact and keep the latest on the record
    pub async fn observe(&self) -> Result<ObservedMetrics> {
        let config = self.config();
        let metrics = self
            .target
            .observe_metrics(&config.environment, &config.artifact)
            .await?;
        let latest = metrics.clone();
        self.entry
            .with_record(|record| record.metrics.last_observed = Some(latest));
        Ok(metrics)
    }

    pub fn stage_completed(&self, stage: usize, percentage: u8) {
        self.entry
            .with_record(|record| record.metrics.canary_stages_completed += 1);
        self.log(format!("stage {} at {percentage}% passed analysis", stage + 1));
        self.events.append(
            events::DEPLOYMENT_STAGE_COMPLETED,
            Some(self.deployment_id()),
            json!({ "stage": stage + 1, "percentage": percentage }),
        );
    }

    /// Pause the deployment from inside the strategy
    pub fn request_pause(&self, reason: &str) -> Result<()> {
        self.entry.pause(reason)
    }

    fn cancelled(&self) -> OrchestratorError {
        OrchestratorError::Cancelled(format!("deployment {} cancelled", self.deployment_id()))
    }

    /// Wait while paused; fails with `Cancelled` once the deployment is cancelled
    pub async fn checkpoint(&mut self) -> Result<()> {
        let mut paused_since: Option<Instant> = None;
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                ExecutionControl::Running => {
                    if let Some(since) = paused_since {
                        self.paused_total += since.elapsed();
                        info!(
                            deployment_id = %self.deployment_id(),
                            paused_ms = since.elapsed().as_millis() as u64,
                            "▶️ Deployment continuing after pause"
                        );
                    }
                    return Ok(());
                }
                ExecutionControl::Cancelled => return Err(self.cancelled()),
                ExecutionControl::Paused => {
                    if paused_since.is_none() {
                        paused_since = Some(Instant::now());
                        info!(deployment_id = %self.deployment_id(), "⏸️ Deployment holding at checkpoint");
                    }
                    if self.control.changed().await.is_err() {
                        return Err(self.cancelled());
                    }
                }
            }
        }
    }

    /// Wait for the next pause, resume or cancel signal
    pub async fn control_changed(&mut self) -> Result<()> {
        self.control.changed().await.map_err(|_| self.cancelled())
    }

    /// Sleep that ends early with `Cancelled`; pausing takes effect at the next checkpoint
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.control.changed() => {
                    if changed.is_err()
                        || *self.control.borrow_and_update() == ExecutionControl::Cancelled
                    {
                        return Err(self.cancelled());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::target::InMemoryTarget;

    fn entry(strategy: &str) -> (Arc<DeploymentEntry>, EventStore) {
        let events = EventStore::default();
        let mut config = DeploymentConfig::new(strategy, "staging", "api:2");
        config.id = "dep-1".to_string();
        let strategy = DeploymentStrategy::from_config(&config).ok();
        (
            Arc::new(DeploymentEntry::new(config, strategy, events.clone())),
            events,
        )
    }

    fn context(entry: Arc<DeploymentEntry>, events: EventStore) -> ExecutionContext {
        let target: Arc<dyn DeploymentTarget> = Arc::new(InMemoryTarget::new());
        let validation = Arc::new(ValidationManager::new(
            Arc::clone(&target),
            events.clone(),
            Duration::from_secs(1),
            0,
        ));
        ExecutionContext::new(entry, target, validation, events)
    }

    #[test]
    fn test_transition_mirrors_record() {
        let (entry, _) = entry("canary");
        entry.transition(DeploymentEvent::StartValidation).unwrap();
        let record = entry.snapshot();
        assert_eq!(record.status, DeploymentStatus::Validating);
        assert_eq!(record.transitions.len(), 1);
        assert_eq!(entry.status(), DeploymentStatus::Validating);
        assert!(record.logs[0].message.contains("pending -> validating"));
    }

    #[test]
    fn test_blue_green_cannot_pause() {
        let (entry, _) = entry("blue-green");
        entry.transition(DeploymentEvent::StartValidation).unwrap();
        entry.transition(DeploymentEvent::StartExecution).unwrap();
        assert!(entry.pause("operator").is_err());
        assert_eq!(entry.control(), ExecutionControl::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_changed_sleeps_until_signalled() {
        let (entry, events) = entry("rolling");
        entry.transition(DeploymentEvent::StartValidation).unwrap();
        entry.transition(DeploymentEvent::StartExecution).unwrap();
        let mut ctx = context(Arc::clone(&entry), events);
        ctx.checkpoint().await.unwrap();

        // the paused clock only advances while the task is idle
        tokio::select! {
            _ = ctx.control_changed() => panic!("woke without a control signal"),
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        entry.pause("operator").unwrap();
        ctx.control_changed().await.unwrap();
        assert_eq!(entry.control(), ExecutionControl::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_waits_for_resume_and_tracks_pause() {
        let (entry, events) = entry("rolling");
        entry.transition(DeploymentEvent::StartValidation).unwrap();
        entry.transition(DeploymentEvent::StartExecution).unwrap();
        entry.pause("operator").unwrap();

        let mut ctx = context(Arc::clone(&entry), events);
        let resumer = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                entry.resume().unwrap();
            })
        };

        ctx.checkpoint().await.unwrap();
        resumer.await.unwrap();
        assert!(ctx.paused_total() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let (entry, events) = entry("rolling");
        let mut ctx = context(Arc::clone(&entry), events);
        let canceller = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                entry.set_control(ExecutionControl::Cancelled);
            })
        };

        let err = ctx.sleep(Duration::from_secs(600)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_traffic_shift_recorded_as_change() {
        let (entry, store) = entry("canary");
        let ctx = context(Arc::clone(&entry), store.clone());
        ctx.shift_traffic("api:2", 10).await.unwrap();
        ctx.shift_traffic("api:2", 50).await.unwrap();

        assert_eq!(
            entry.changes()[1],
            AppliedChange::TrafficShifted {
                artifact: "api:2".to_string(),
                from: 10,
                to: 50
            }
        );
        assert_eq!(entry.snapshot().metrics.traffic_percentage, 50);
        assert_eq!(
            store
                .events_for_entity("dep-1")
                .iter()
                .filter(|e| e.event_type == events::DEPLOYMENT_TRAFFIC_SHIFTED)
                .count(),
            2
        );
    }
}
