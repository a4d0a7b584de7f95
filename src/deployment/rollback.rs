//! # Rollback Manager
//!
//! Builds an ordered rollback plan by reversing the changes a strategy
//! applied, checks that the plan can run (the artifacts it relaunches still
//! exist), and executes it under a timeout. A failed rollback is terminal:
//! it is reported and never retried automatically.

use super::target::DeploymentTarget;
use super::types::DeploymentConfig;
use crate::constants::events;
use crate::error::{ErrorInfo, OrchestratorError, Result};
use crate::events::EventStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// An infrastructure change applied while executing a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppliedChange {
    EnvironmentProvisioned {
        slot: String,
        artifact: String,
    },
    TrafficShifted {
        artifact: String,
        from: u8,
        to: u8,
    },
    InstancesLaunched {
        artifact: String,
        ids: Vec<String>,
    },
    InstancesTerminated {
        artifact: String,
        count: u32,
    },
}

/// One step of a rollback plan, undoing an [`AppliedChange`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackStep {
    DecommissionEnvironment { slot: String },
    RestoreTraffic { artifact: String, percentage: u8 },
    TerminateInstances { ids: Vec<String> },
    RelaunchInstances { artifact: String, count: u32 },
}

impl RollbackStep {
    fn estimated_duration(&self) -> Duration {
        match self {
            Self::DecommissionEnvironment { .. } => Duration::from_secs(30),
            Self::RestoreTraffic { .. } => Duration::from_secs(5),
            Self::TerminateInstances { ids } => Duration::from_secs(5 * ids.len() as u64),
            Self::RelaunchInstances { count, .. } => Duration::from_secs(20 * *count as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub deployment_id: String,
    pub environment: String,
    /// Executed in order; the reverse of the applied changes
    pub steps: Vec<RollbackStep>,
    pub estimated_duration_ms: u64,
    pub risks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RollbackPlan {
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTrigger {
    Automatic,
    Manual,
}

/// History entry for one rollback attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub deployment_id: String,
    pub trigger: RollbackTrigger,
    pub reason: String,
    pub plan: RollbackPlan,
    pub success: bool,
    pub steps_completed: usize,
    pub error: Option<ErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RollbackManager {
    target: Arc<dyn DeploymentTarget>,
    events: EventStore,
    default_timeout: Duration,
    history: DashMap<String, Vec<RollbackRecord>>,
}

impl RollbackManager {
    pub fn new(
        target: Arc<dyn DeploymentTarget>,
        events: EventStore,
        default_timeout: Duration,
    ) -> Self {
        Self {
            target,
            events,
            default_timeout,
            history: DashMap::new(),
        }
    }

    /// Reverse the applied changes into an ordered plan
    pub fn create_plan(&self, config: &DeploymentConfig, changes: &[AppliedChange]) -> RollbackPlan {
        let mut steps = Vec::with_capacity(changes.len());
        let mut risks = Vec::new();

        // Only the first shift per artifact matters: restoring its `from` undoes the rest
        let first_shift: HashMap<&str, usize> =
            changes
                .iter()
                .enumerate()
                .rev()
                .filter_map(|(index, change)| match change {
                    AppliedChange::TrafficShifted { artifact, .. } => {
                        Some((artifact.as_str(), index))
                    }
                    _ => None,
                })
                .collect();

        for (index, change) in changes.iter().enumerate().rev() {
            let step = match change {
                AppliedChange::EnvironmentProvisioned { slot, .. } => {
                    RollbackStep::DecommissionEnvironment { slot: slot.clone() }
                }
                AppliedChange::TrafficShifted { artifact, from, .. } => {
                    if first_shift.get(artifact.as_str()) != Some(&index) {
                        continue;
                    }
                    RollbackStep::RestoreTraffic {
                        artifact: artifact.clone(),
                        percentage: *from,
                    }
                }
                AppliedChange::InstancesLaunched { ids, .. } => {
                    RollbackStep::TerminateInstances { ids: ids.clone() }
                }
                AppliedChange::InstancesTerminated { artifact, count } => {
                    risks.push(format!(
                        "relaunching {count} instance(s) of {artifact} depends on the artifact still being available"
                    ));
                    RollbackStep::RelaunchInstances {
                        artifact: artifact.clone(),
                        count: *count,
                    }
                }
            };
            steps.push(step);
        }

        if config.previous_artifact.is_none() {
            risks.push("no previous artifact recorded for this deployment".to_string());
        }
        if steps.is_empty() {
            risks.push("no infrastructure changes were applied".to_string());
        }

        let estimated: Duration = steps.iter().map(RollbackStep::estimated_duration).sum();
        RollbackPlan {
            deployment_id: config.id.clone(),
            environment: config.environment.clone(),
            steps,
            estimated_duration_ms: estimated.as_millis() as u64,
            risks,
            created_at: Utc::now(),
        }
    }

    /// Verify every artifact the plan restores can still be deployed
    pub async fn validate_feasibility(
        &self,
        config: &DeploymentConfig,
        plan: &RollbackPlan,
    ) -> Result<()> {
        let mut artifacts: Vec<&str> = plan
            .steps
            .iter()
            .filter_map(|step| match step {
                RollbackStep::RelaunchInstances { artifact, .. } => Some(artifact.as_str()),
                _ => None,
            })
            .collect();
        if let Some(previous) = config.previous_artifact.as_deref() {
            artifacts.push(previous);
        }
        artifacts.sort_unstable();
        artifacts.dedup();

        for artifact in artifacts {
            let available = self.target.artifact_available(artifact).await.map_err(|e| {
                OrchestratorError::RollbackFailure {
                    deployment_id: config.id.clone(),
                    message: format!("could not verify artifact {artifact}: {e}"),
                }
            })?;
            if !available {
                return Err(OrchestratorError::RollbackFailure {
                    deployment_id: config.id.clone(),
                    message: format!("previous artifact {artifact} is no longer available"),
                });
            }
        }
        Ok(())
    }

    /// Plan, validate and execute a rollback, recording the attempt
    pub async fn rollback(
        &self,
        config: &DeploymentConfig,
        changes: &[AppliedChange],
        trigger: RollbackTrigger,
        reason: &str,
    ) -> Result<RollbackRecord> {
        let plan = self.create_plan(config, changes);
        let started_at = Utc::now();
        let timeout = config
            .rollback
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        info!(
            deployment_id = %config.id,
            trigger = ?trigger,
            steps = plan.steps.len(),
            timeout_seconds = timeout.as_secs(),
            "⏪ Executing rollback plan"
        );

        let mut steps_completed = 0usize;
        let outcome = match self.validate_feasibility(config, &plan).await {
            Err(e) => Err(e),
            Ok(()) => {
                let execution = tokio::time::timeout(
                    timeout,
                    self.execute_steps(config, &plan, &mut steps_completed),
                )
                .await;
                match execution {
                    Ok(result) => result,
                    Err(_) => Err(OrchestratorError::RollbackFailure {
                        deployment_id: config.id.clone(),
                        message: format!(
                            "rollback timed out after {}s ({steps_completed}/{} steps)",
                            timeout.as_secs(),
                            plan.steps.len()
                        ),
                    }),
                }
            }
        };

        let record = RollbackRecord {
            deployment_id: config.id.clone(),
            trigger,
            reason: reason.to_string(),
            success: outcome.is_ok(),
            steps_completed,
            error: outcome.as_ref().err().map(ErrorInfo::from),
            plan,
            started_at,
            finished_at: Utc::now(),
        };
        self.history
            .entry(config.id.clone())
            .or_default()
            .push(record.clone());

        match outcome {
            Ok(()) => Ok(record),
            Err(e) => {
                error!(
                    deployment_id = %config.id,
                    error = %e,
                    "🚨 Rollback failed; manual intervention required"
                );
                self.events.append(
                    events::DEPLOYMENT_ROLLBACK_FAILED,
                    Some(&config.id),
                    json!({
                        "trigger": trigger,
                        "reason": reason,
                        "error": e.to_string(),
                        "steps_completed": record.steps_completed,
                    }),
                );
                Err(e)
            }
        }
    }

    async fn execute_steps(
        &self,
        config: &DeploymentConfig,
        plan: &RollbackPlan,
        steps_completed: &mut usize,
    ) -> Result<()> {
        let environment = config.environment.as_str();
        for step in &plan.steps {
            let result = match step {
                RollbackStep::DecommissionEnvironment { slot } => {
                    self.target.decommission_environment(environment, slot).await
                }
                RollbackStep::RestoreTraffic {
                    artifact,
                    percentage,
                } => {
                    self.target
                        .set_traffic_split(environment, artifact, *percentage)
                        .await
                }
                RollbackStep::TerminateInstances { ids } => {
                    self.target.terminate_instances(environment, ids).await
                }
                RollbackStep::RelaunchInstances { artifact, count } => self
                    .target
                    .launch_instances(environment, artifact, *count)
                    .await
                    .map(|_| ()),
            };
            result.map_err(|e| OrchestratorError::RollbackFailure {
                deployment_id: config.id.clone(),
                message: format!("step {} failed: {e}", *steps_completed + 1),
            })?;
            *steps_completed += 1;
        }
        Ok(())
    }

    pub fn history(&self, deployment_id: &str) -> Vec<RollbackRecord> {
        self.history
            .get(deployment_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::target::InMemoryTarget;
    use crate::error::ErrorCategory;

    fn config() -> DeploymentConfig {
        let mut config = DeploymentConfig::new("rolling", "prod", "api:2");
        config.id = "dep-1".to_string();
        config.previous_artifact = Some("api:1".to_string());
        config
    }

    fn rolling_changes() -> Vec<AppliedChange> {
        vec![
            AppliedChange::InstancesTerminated {
                artifact: "api:1".to_string(),
                count: 1,
            },
            AppliedChange::InstancesLaunched {
                artifact: "api:2".to_string(),
                ids: vec!["prod-9".to_string()],
            },
            AppliedChange::TrafficShifted {
                artifact: "api:2".to_string(),
                from: 0,
                to: 100,
            },
        ]
    }

    #[test]
    fn test_plan_reverses_changes() {
        let manager = RollbackManager::new(
            Arc::new(InMemoryTarget::new()),
            EventStore::default(),
            Duration::from_secs(60),
        );
        let plan = manager.create_plan(&config(), &rolling_changes());

        assert_eq!(
            plan.steps,
            vec![
                RollbackStep::RestoreTraffic {
                    artifact: "api:2".to_string(),
                    percentage: 0
                },
                RollbackStep::TerminateInstances {
                    ids: vec!["prod-9".to_string()]
                },
                RollbackStep::RelaunchInstances {
                    artifact: "api:1".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(plan.estimated_duration(), Duration::from_secs(30));
        assert_eq!(plan.risks.len(), 1);
    }

    #[test]
    fn test_repeated_traffic_shifts_restore_once() {
        let manager = RollbackManager::new(
            Arc::new(InMemoryTarget::new()),
            EventStore::default(),
            Duration::from_secs(60),
        );
        let changes: Vec<AppliedChange> = [(0, 10), (10, 50), (50, 100)]
            .into_iter()
            .map(|(from, to)| AppliedChange::TrafficShifted {
                artifact: "api:2".to_string(),
                from,
                to,
            })
            .collect();

        let plan = manager.create_plan(&config(), &changes);
        assert_eq!(
            plan.steps,
            vec![RollbackStep::RestoreTraffic {
                artifact: "api:2".to_string(),
                percentage: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_unavailable_artifact_is_rollback_failure() {
        let target = Arc::new(InMemoryTarget::new());
        target.mark_artifact_unavailable("api:1");
        let store = EventStore::default();
        let manager = RollbackManager::new(target, store.clone(), Duration::from_secs(60));

        let err = manager
            .rollback(&config(), &rolling_changes(), RollbackTrigger::Manual, "operator")
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::RollbackFailure);
        let history = manager.history("dep-1");
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].steps_completed, 0);
        assert!(store
            .events_for_entity("dep-1")
            .iter()
            .any(|e| e.event_type == events::DEPLOYMENT_ROLLBACK_FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_times_out() {
        let target = Arc::new(InMemoryTarget::new());
        target.set_latency(Duration::from_secs(120));
        let manager = RollbackManager::new(target, EventStore::default(), Duration::from_secs(60));

        let err = manager
            .rollback(&config(), &rolling_changes(), RollbackTrigger::Automatic, "breach")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_successful_rollback_records_history() {
        let target = Arc::new(InMemoryTarget::new().with_instances("prod", "api:2", 1));
        let manager = RollbackManager::new(
            target.clone(),
            EventStore::default(),
            Duration::from_secs(60),
        );
        let record = manager
            .rollback(&config(), &rolling_changes(), RollbackTrigger::Manual, "operator")
            .await
            .unwrap();

        assert!(record.success);
        assert_eq!(record.steps_completed, 3);
        let traffic = target.traffic("prod").unwrap();
        assert_eq!(traffic.percentage, 0);
    }
}
