//! # Deployment Orchestrator
//!
//! Owns every deployment and drives it through its lifecycle:
//!
//! ```text
//! pending -> validating -> executing <-> paused -> completed
//!                 |             |                     |
//!                 +---> failed <+----> rolled-back <--+
//! ```
//!
//! `create_deployment` validates the request synchronously and hands the run
//! to a spawned task. The task runs pre-deployment checks, executes the
//! strategy, runs post-deployment checks and completes. Strategy failures
//! trigger an automatic rollback unless the deployment disabled it. Operators
//! pause, resume and roll back through the orchestrator; a manual rollback
//! cancels the running task before reverting its changes.

use super::analytics::{AnalyticsManager, DeploymentAnalytics};
use super::approval::ApprovalManager;
use super::execution::{DeploymentEntry, ExecutionContext, ExecutionControl};
use super::promotion::{PromotionCheck, PromotionManager};
use super::rollback::{RollbackManager, RollbackPlan, RollbackRecord, RollbackTrigger};
use super::strategies::execute_strategy;
use super::target::DeploymentTarget;
use super::types::{
    DeploymentConfig, DeploymentFilter, DeploymentRecord, DeploymentResult, DeploymentStrategy,
    LogLevel, PromotionResult,
};
use super::validation::{ValidationManager, ValidationResult};
use crate::config::DeploymentSettings;
use crate::constants::events;
use crate::error::{ErrorCategory, ErrorInfo, OrchestratorError, Result};
use crate::events::EventStore;
use crate::logging::{log_deployment_operation, log_error};
use crate::state_machine::{DeploymentEvent, DeploymentStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct DeploymentOrchestrator {
    deployments: DashMap<String, Arc<DeploymentEntry>>,
    target: Arc<dyn DeploymentTarget>,
    validation: Arc<ValidationManager>,
    rollback: RollbackManager,
    approvals: Arc<ApprovalManager>,
    promotion: PromotionManager,
    analytics: AnalyticsManager,
    events: EventStore,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("deployments", &self.deployments.len())
            .field("target", &self.target)
            .finish()
    }
}

impl DeploymentOrchestrator {
    pub fn new(
        target: Arc<dyn DeploymentTarget>,
        settings: &DeploymentSettings,
        events: EventStore,
    ) -> Self {
        let validation = Arc::new(ValidationManager::new(
            Arc::clone(&target),
            events.clone(),
            settings.default_check_timeout(),
            settings.default_check_retries,
        ));
        let rollback = RollbackManager::new(
            Arc::clone(&target),
            events.clone(),
            settings.default_rollback_timeout(),
        );
        let approvals = Arc::new(ApprovalManager::new(
            events.clone(),
            settings.approval_timeout(),
        ));
        let promotion =
            PromotionManager::new(settings.promotion_stages.clone(), Arc::clone(&approvals));

        Self {
            deployments: DashMap::new(),
            target,
            validation,
            rollback,
            approvals,
            promotion,
            analytics: AnalyticsManager::new(),
            events,
        }
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    pub fn analytics(&self) -> &AnalyticsManager {
        &self.analytics
    }

    pub fn rollback_history(&self, deployment_id: &str) -> Vec<RollbackRecord> {
        self.rollback.history(deployment_id)
    }

    fn entry(&self, deployment_id: &str) -> Result<Arc<DeploymentEntry>> {
        self.deployments
            .get(deployment_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::not_found("deployment", deployment_id))
    }

    /// Accept a deployment and start it in the background
    ///
    /// Malformed requests (unknown strategy, bad strategy settings, missing
    /// environment or artifact) are recorded as `failed` and never start.
    pub async fn create_deployment(self: &Arc<Self>, mut config: DeploymentConfig) -> DeploymentResult {
        config.ensure_id();
        let id = config.id.clone();

        let parsed = config
            .validate_shape()
            .and_then(|()| DeploymentStrategy::from_config(&config));
        let (strategy, rejection) = match parsed {
            Ok(strategy) => (Some(strategy), None),
            Err(e) => (None, Some(e)),
        };

        let entry = match self.deployments.entry(id.clone()) {
            Entry::Occupied(_) => {
                let err = OrchestratorError::validation(format!("deployment {id} already exists"));
                return DeploymentResult::error(&id, None, &err);
            }
            Entry::Vacant(slot) => {
                let entry = Arc::new(DeploymentEntry::new(config, strategy, self.events.clone()));
                slot.insert(Arc::clone(&entry));
                entry
            }
        };

        let config = &entry.config;
        self.events.append(
            events::DEPLOYMENT_CREATED,
            Some(&id),
            json!({
                "name": config.name,
                "strategy": config.strategy,
                "environment": config.environment,
                "artifact": config.artifact,
                "components": config.components,
                "promoted_from": config.promoted_from,
            }),
        );
        log_deployment_operation(
            "create",
            &id,
            Some(&config.strategy),
            Some(&config.environment),
            "pending",
            None,
        );

        if let Some(error) = rejection {
            entry.with_record(|record| record.error = Some(ErrorInfo::from(&error)));
            self.fail(&entry, &error);
            return DeploymentResult::error(&id, Some(entry.status()), &error);
        }

        let handle = tokio::spawn(Arc::clone(self).run(Arc::clone(&entry)));
        entry.set_task(handle);
        DeploymentResult::ok(&id, DeploymentStatus::Pending, format!("deployment {id} accepted"))
    }

    pub fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        Ok(self.entry(deployment_id)?.snapshot())
    }

    /// Deployments matching the filter, oldest first
    pub fn list_deployments(&self, filter: &DeploymentFilter) -> Vec<DeploymentRecord> {
        let mut records: Vec<DeploymentRecord> = self
            .deployments
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.config_id.cmp(&b.config_id))
        });
        records
    }

    /// Re-run the post-deployment checks and keep the result on the record
    pub async fn validate_deployment(&self, deployment_id: &str) -> Result<ValidationResult> {
        let entry = self.entry(deployment_id)?;
        let result = self.validation.run_post_deployment(&entry.config).await;
        let stored = result.clone();
        entry.with_record(|record| record.validation = Some(stored));
        entry.log(
            if result.success {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            format!("on-demand validation: {}", result.message),
        );
        Ok(result)
    }

    /// Preview the plan a rollback would execute right now
    pub fn rollback_plan(&self, deployment_id: &str) -> Result<RollbackPlan> {
        let entry = self.entry(deployment_id)?;
        Ok(self.rollback.create_plan(&entry.config, &entry.changes()))
    }

    /// Stop the deployment if it is running and revert its applied changes
    pub async fn rollback_deployment(&self, deployment_id: &str) -> DeploymentResult {
        let entry = match self.entry(deployment_id) {
            Ok(entry) => entry,
            Err(e) => return DeploymentResult::error(deployment_id, None, &e),
        };

        let status = entry.status();
        if !status.can_roll_back() {
            let err = OrchestratorError::InvalidState(format!(
                "deployment {deployment_id} cannot be rolled back from {status}"
            ));
            return DeploymentResult::error(deployment_id, Some(status), &err);
        }
        if !entry.try_begin_rollback() {
            let err = OrchestratorError::InvalidState(format!(
                "deployment {deployment_id} is already rolling back"
            ));
            return DeploymentResult::error(deployment_id, Some(status), &err);
        }

        entry.set_control(ExecutionControl::Cancelled);
        if let Some(task) = entry.take_task() {
            if let Err(e) = task.await {
                log_error(
                    "deployment",
                    "rollback",
                    &e.to_string(),
                    Some("deployment task ended abnormally"),
                );
            }
        }

        // The task may have settled the deployment while it was stopping
        let status = entry.status();
        let outcome = if status.can_roll_back() {
            self.perform_rollback(&entry, RollbackTrigger::Manual, "manual rollback requested")
                .await
        } else {
            Err(OrchestratorError::InvalidState(format!(
                "deployment {deployment_id} cannot be rolled back from {status}"
            )))
        };
        entry.end_rollback();

        match outcome {
            Ok(record) => DeploymentResult::ok(
                deployment_id,
                DeploymentStatus::RolledBack,
                format!(
                    "rolled back {} step(s) in {}ms",
                    record.steps_completed,
                    (record.finished_at - record.started_at).num_milliseconds()
                ),
            ),
            Err(e) => DeploymentResult::error(deployment_id, Some(entry.status()), &e),
        }
    }

    pub fn pause_deployment(&self, deployment_id: &str) -> DeploymentResult {
        let entry = match self.entry(deployment_id) {
            Ok(entry) => entry,
            Err(e) => return DeploymentResult::error(deployment_id, None, &e),
        };
        match entry.pause("operator request") {
            Ok(()) => {
                log_deployment_operation("pause", deployment_id, None, None, "paused", None);
                self.events.append(events::DEPLOYMENT_PAUSED, Some(deployment_id), json!({}));
                DeploymentResult::ok(deployment_id, DeploymentStatus::Paused, "deployment paused")
            }
            Err(e) => DeploymentResult::error(deployment_id, Some(entry.status()), &e),
        }
    }

    pub fn resume_deployment(&self, deployment_id: &str) -> DeploymentResult {
        let entry = match self.entry(deployment_id) {
            Ok(entry) => entry,
            Err(e) => return DeploymentResult::error(deployment_id, None, &e),
        };
        match entry.resume() {
            Ok(()) => {
                log_deployment_operation("resume", deployment_id, None, None, "executing", None);
                self.events.append(events::DEPLOYMENT_RESUMED, Some(deployment_id), json!({}));
                DeploymentResult::ok(deployment_id, DeploymentStatus::Executing, "deployment resumed")
            }
            Err(e) => DeploymentResult::error(deployment_id, Some(entry.status()), &e),
        }
    }

    /// Wait until the deployment reaches a terminal status
    pub async fn await_completion(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        let entry = self.entry(deployment_id)?;
        let mut status = entry.subscribe_status();
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
        Ok(entry.snapshot())
    }

    /// Start a copy of a successful deployment in the next pipeline stage
    pub async fn promote_deployment(
        self: &Arc<Self>,
        deployment_id: &str,
        from: &str,
        to: &str,
    ) -> PromotionResult {
        let failure = |error: &OrchestratorError, approval_id: Option<String>| PromotionResult {
            success: false,
            source_deployment_id: deployment_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            new_deployment_id: None,
            approval_id,
            message: error.to_string(),
            category: Some(error.category()),
        };

        let entry = match self.entry(deployment_id) {
            Ok(entry) => entry,
            Err(e) => return failure(&e, None),
        };
        let approval_id = match self.promotion.check(&entry.snapshot(), from, to) {
            Err(e) => return failure(&e, None),
            Ok(PromotionCheck::AwaitingApproval { approval_id }) => {
                info!(
                    deployment_id = %deployment_id,
                    stage = %to,
                    approval_id = %approval_id,
                    "⏳ Promotion awaiting approval"
                );
                return PromotionResult {
                    success: false,
                    source_deployment_id: deployment_id.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    new_deployment_id: None,
                    message: format!("promotion to {to} awaits approval {approval_id}"),
                    approval_id: Some(approval_id),
                    category: Some(ErrorCategory::InvalidState),
                };
            }
            Ok(PromotionCheck::Ready { approval_id }) => approval_id,
        };

        let mut config = entry.config.clone();
        config.id = String::new();
        config.name = format!("{}-{to}", entry.config.name);
        config.environment = to.to_string();
        config.previous_artifact = self.current_artifact(to);
        config.promoted_from = Some(deployment_id.to_string());

        let result = self.create_deployment(config).await;
        if result.success {
            log_deployment_operation(
                "promote",
                deployment_id,
                None,
                Some(to),
                "promoted",
                Some(&result.deployment_id),
            );
            self.events.append(
                events::DEPLOYMENT_PROMOTED,
                Some(deployment_id),
                json!({
                    "from": from,
                    "to": to,
                    "new_deployment_id": result.deployment_id,
                    "approval_id": approval_id,
                }),
            );
        }

        PromotionResult {
            success: result.success,
            source_deployment_id: deployment_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            new_deployment_id: Some(result.deployment_id),
            approval_id,
            message: result.message,
            category: result.category,
        }
    }

    /// Artifact of the latest completed deployment in an environment
    fn current_artifact(&self, environment: &str) -> Option<String> {
        self.deployments
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|r| r.environment == environment && r.status == DeploymentStatus::Completed)
            .max_by_key(|r| r.completed_at)
            .map(|r| r.artifact)
    }

    /// Apply a transition, recording analytics when it is terminal
    fn transition(&self, entry: &DeploymentEntry, event: DeploymentEvent) -> Result<DeploymentStatus> {
        entry.transition_with(event, |record| {
            self.analytics
                .record(DeploymentAnalytics::from_record(record, &entry.config.components));
        })
    }

    fn fail(&self, entry: &DeploymentEntry, error: &OrchestratorError) {
        entry.log(LogLevel::Error, error.to_string());
        match self.transition(entry, DeploymentEvent::Fail(error.to_string())) {
            Ok(_) => {
                log_deployment_operation(
                    "fail",
                    entry.id(),
                    Some(&entry.config.strategy),
                    Some(&entry.config.environment),
                    "failed",
                    Some(&error.to_string()),
                );
                self.events.append(
                    events::DEPLOYMENT_FAILED,
                    Some(entry.id()),
                    json!({ "error": ErrorInfo::from(error) }),
                );
            }
            Err(e) => warn!(deployment_id = %entry.id(), error = %e, "Could not mark deployment failed"),
        }
    }

    async fn run(self: Arc<Self>, entry: Arc<DeploymentEntry>) {
        match self.drive(&entry).await {
            Ok(()) => {}
            Err(OrchestratorError::Cancelled(reason)) => {
                debug!(deployment_id = %entry.id(), reason = %reason, "Deployment task stopped");
            }
            Err(e) => log_error(
                "deployment",
                "execute",
                &e.to_string(),
                Some(entry.id()),
            ),
        }
    }

    async fn drive(&self, entry: &Arc<DeploymentEntry>) -> Result<()> {
        let Some(strategy) = entry.strategy.clone() else {
            return Err(OrchestratorError::InvalidState(format!(
                "deployment {} has no runnable strategy",
                entry.id()
            )));
        };

        self.transition(entry, DeploymentEvent::StartValidation)?;
        let pre = self.validation.run_pre_deployment(&entry.config).await;
        let passed = pre.success;
        let message = pre.message.clone();
        entry.with_record(|record| record.validation = Some(pre));
        if !passed {
            let error =
                OrchestratorError::validation(format!("pre-deployment validation failed: {message}"));
            entry.with_record(|record| record.error = Some(ErrorInfo::from(&error)));
            self.fail(entry, &error);
            return Err(error);
        }
        if entry.control() == ExecutionControl::Cancelled {
            return Err(OrchestratorError::Cancelled(format!(
                "deployment {} cancelled during validation",
                entry.id()
            )));
        }

        self.transition(entry, DeploymentEvent::StartExecution)?;
        info!(
            deployment_id = %entry.id(),
            strategy = %strategy.kind(),
            environment = %entry.config.environment,
            "🚀 Executing deployment strategy"
        );
        let mut ctx = ExecutionContext::new(
            Arc::clone(entry),
            Arc::clone(&self.target),
            Arc::clone(&self.validation),
            self.events.clone(),
        );
        if let Err(error) = execute_strategy(&mut ctx, &strategy).await {
            if matches!(error, OrchestratorError::Cancelled(_)) {
                return Err(error);
            }
            return self.handle_failure(entry, error).await;
        }

        let post = self.validation.run_post_deployment(&entry.config).await;
        let passed = post.success;
        let message = post.message.clone();
        entry.with_record(|record| record.validation = Some(post));
        if !passed {
            let error = OrchestratorError::validation(format!(
                "post-deployment validation failed: {message}"
            ));
            return self.handle_failure(entry, error).await;
        }

        // A pause that lands after the strategy's last checkpoint holds completion
        loop {
            ctx.checkpoint().await?;
            match self.transition(entry, DeploymentEvent::Complete) {
                Ok(_) => break,
                // Status flips before the control signal; wait for the signal
                Err(_) if entry.status() == DeploymentStatus::Paused => {
                    ctx.control_changed().await?;
                }
                Err(e) => return Err(e),
            }
        }

        entry.with_record(|record| record.progress = 100.0);
        log_deployment_operation(
            "complete",
            entry.id(),
            Some(&entry.config.strategy),
            Some(&entry.config.environment),
            "completed",
            Some(&format!("{}ms", entry.elapsed().as_millis())),
        );
        self.events.append(
            events::DEPLOYMENT_COMPLETED,
            Some(entry.id()),
            json!({
                "artifact": entry.config.artifact,
                "duration_ms": entry.elapsed().as_millis() as u64,
            }),
        );
        Ok(())
    }

    /// Record the failure and roll back automatically when the deployment allows it
    async fn handle_failure(&self, entry: &DeploymentEntry, error: OrchestratorError) -> Result<()> {
        entry.with_record(|record| record.error = Some(ErrorInfo::from(&error)));
        warn!(
            deployment_id = %entry.id(),
            error = %error,
            automatic_rollback = entry.config.rollback.automatic,
            "⚠️ Deployment failed"
        );

        if !entry.config.rollback.automatic {
            self.fail(entry, &error);
            return Err(error);
        }
        // Otherwise a manual rollback already owns the deployment
        if entry.try_begin_rollback() {
            let outcome = self
                .perform_rollback(entry, RollbackTrigger::Automatic, &error.to_string())
                .await;
            entry.end_rollback();
            outcome?;
        }
        Err(error)
    }

    async fn perform_rollback(
        &self,
        entry: &DeploymentEntry,
        trigger: RollbackTrigger,
        reason: &str,
    ) -> Result<RollbackRecord> {
        let changes = entry.changes();
        match self
            .rollback
            .rollback(&entry.config, &changes, trigger, reason)
            .await
        {
            Ok(record) => {
                entry.with_record(|r| r.rollback_count += 1);
                entry.log(
                    LogLevel::Warn,
                    format!(
                        "rolled back {} step(s): {reason}",
                        record.steps_completed
                    ),
                );
                self.transition(entry, DeploymentEvent::RollBack)?;
                log_deployment_operation(
                    "rollback",
                    entry.id(),
                    Some(&entry.config.strategy),
                    Some(&entry.config.environment),
                    "rolled-back",
                    Some(reason),
                );
                self.events.append(
                    events::DEPLOYMENT_ROLLED_BACK,
                    Some(entry.id()),
                    json!({
                        "trigger": trigger,
                        "reason": reason,
                        "steps_completed": record.steps_completed,
                    }),
                );
                Ok(record)
            }
            Err(error) => {
                entry.with_record(|r| r.error = Some(ErrorInfo::from(&error)));
                if !entry.status().is_terminal() {
                    self.fail(entry, &error);
                } else {
                    entry.log(LogLevel::Error, error.to_string());
                }
                Err(error)
            }
        }
    }
}
