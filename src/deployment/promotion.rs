//! # Promotion Manager
//!
//! Promotion moves a successful deployment to the next environment of an
//! ordered pipeline. The target stage's prerequisites must hold and, when the
//! stage is approval-gated, its approval must be `approved`.

use super::approval::{ApprovalManager, ApprovalStatus};
use super::types::DeploymentRecord;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::DeploymentStatus;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A condition the source deployment must meet before promotion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Prerequisite {
    /// Source deployment reached `completed`
    SourceCompleted,
    /// The latest validation of the source deployment succeeded
    ValidationPassed,
    /// Source deployment has been complete for at least this long
    MinimumSoak { seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub approvers: Vec<String>,
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    /// Falls back to `deployment.approval_timeout_seconds`
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_min_approvals() -> u32 {
    1
}

/// One environment of the promotion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionStage {
    /// Environment name
    pub name: String,
    /// Conditions checked when promoting *into* this stage
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub approval: Option<ApprovalPolicy>,
}

impl PromotionStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prerequisites: Vec::new(),
            approval: None,
        }
    }

    /// development, staging, production; production is approval-gated
    pub fn default_pipeline() -> Vec<Self> {
        vec![
            Self::new("development"),
            Self {
                name: "staging".to_string(),
                prerequisites: vec![Prerequisite::SourceCompleted, Prerequisite::ValidationPassed],
                approval: None,
            },
            Self {
                name: "production".to_string(),
                prerequisites: vec![Prerequisite::SourceCompleted, Prerequisite::ValidationPassed],
                approval: Some(ApprovalPolicy {
                    approvers: vec!["release-manager".to_string()],
                    min_approvals: 1,
                    timeout_seconds: None,
                }),
            },
        ]
    }
}

/// Whether a promotion may proceed now
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionCheck {
    Ready { approval_id: Option<String> },
    AwaitingApproval { approval_id: String },
}

#[derive(Debug)]
pub struct PromotionManager {
    stages: Vec<PromotionStage>,
    approvals: Arc<ApprovalManager>,
}

impl PromotionManager {
    pub fn new(stages: Vec<PromotionStage>, approvals: Arc<ApprovalManager>) -> Self {
        Self { stages, approvals }
    }

    pub fn stages(&self) -> &[PromotionStage] {
        &self.stages
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|stage| stage.name == name)
            .ok_or_else(|| {
                OrchestratorError::validation(format!("'{name}' is not a promotion stage"))
            })
    }

    /// Check pipeline order, prerequisites and approval for `from -> to`
    ///
    /// Requests the approval when the target stage is gated and none exists
    /// yet (or the previous one expired).
    pub fn check(&self, source: &DeploymentRecord, from: &str, to: &str) -> Result<PromotionCheck> {
        let from_index = self.position(from)?;
        let to_index = self.position(to)?;
        if to_index != from_index + 1 {
            return Err(OrchestratorError::validation(format!(
                "cannot promote from {from} to {to}; stages must be adjacent"
            )));
        }
        if source.environment != from {
            return Err(OrchestratorError::validation(format!(
                "deployment {} runs in {}, not {from}",
                source.config_id, source.environment
            )));
        }

        let stage = &self.stages[to_index];
        for prerequisite in &stage.prerequisites {
            check_prerequisite(prerequisite, source)?;
        }

        let Some(policy) = &stage.approval else {
            return Ok(PromotionCheck::Ready { approval_id: None });
        };

        match self.approvals.find_for(&source.config_id, to) {
            Some(request) if request.status == ApprovalStatus::Approved => {
                Ok(PromotionCheck::Ready {
                    approval_id: Some(request.id),
                })
            }
            Some(request) if request.status == ApprovalStatus::Pending => {
                Ok(PromotionCheck::AwaitingApproval {
                    approval_id: request.id,
                })
            }
            Some(request) if request.status == ApprovalStatus::Rejected => {
                Err(OrchestratorError::InvalidState(format!(
                    "promotion to {to} was rejected (approval {})",
                    request.id
                )))
            }
            _ => {
                debug!(deployment_id = %source.config_id, stage = %to, "Requesting promotion approval");
                let request = self.approvals.request_approval(
                    &source.config_id,
                    to,
                    policy.approvers.clone(),
                    policy.min_approvals,
                    policy.timeout_seconds.map(Duration::from_secs),
                )?;
                Ok(PromotionCheck::AwaitingApproval {
                    approval_id: request.id,
                })
            }
        }
    }
}

fn check_prerequisite(prerequisite: &Prerequisite, source: &DeploymentRecord) -> Result<()> {
    let unmet = |reason: String| {
        Err(OrchestratorError::InvalidState(format!(
            "promotion prerequisite not met for {}: {reason}",
            source.config_id
        )))
    };

    match prerequisite {
        Prerequisite::SourceCompleted if source.status != DeploymentStatus::Completed => {
            unmet(format!("status is {}", source.status))
        }
        Prerequisite::ValidationPassed
            if !source.validation.as_ref().is_some_and(|v| v.success) =>
        {
            unmet("validation has not passed".to_string())
        }
        Prerequisite::MinimumSoak { seconds } => {
            let soaked = source
                .completed_at
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
                .unwrap_or(0);
            if soaked < *seconds {
                unmet(format!("soaked {soaked}s of required {seconds}s"))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::approval::ApprovalDecision;
    use crate::deployment::types::DeploymentConfig;
    use crate::deployment::validation::ValidationResult;
    use crate::events::EventStore;

    fn manager() -> (PromotionManager, Arc<ApprovalManager>) {
        let approvals = Arc::new(ApprovalManager::new(
            EventStore::default(),
            Duration::from_secs(3600),
        ));
        (
            PromotionManager::new(PromotionStage::default_pipeline(), Arc::clone(&approvals)),
            approvals,
        )
    }

    fn completed(environment: &str) -> DeploymentRecord {
        let mut config = DeploymentConfig::new("rolling", environment, "api:2");
        config.id = "dep-1".to_string();
        let mut record = DeploymentRecord::new(&config);
        record.status = DeploymentStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.validation = Some(ValidationResult {
            deployment_id: "dep-1".to_string(),
            success: true,
            score: 1.0,
            checks: vec![],
            message: "ok".to_string(),
            validated_at: Utc::now(),
        });
        record
    }

    #[test]
    fn test_ungated_stage_is_ready() {
        let (manager, _) = manager();
        let check = manager
            .check(&completed("development"), "development", "staging")
            .unwrap();
        assert_eq!(check, PromotionCheck::Ready { approval_id: None });
    }

    #[test]
    fn test_stages_must_be_adjacent_and_known() {
        let (manager, _) = manager();
        assert!(manager
            .check(&completed("development"), "development", "production")
            .is_err());
        assert!(manager
            .check(&completed("development"), "development", "qa")
            .is_err());
        assert!(manager
            .check(&completed("staging"), "development", "staging")
            .is_err());
    }

    #[test]
    fn test_prerequisites_enforced() {
        let (manager, _) = manager();
        let mut record = completed("development");
        record.status = DeploymentStatus::Failed;
        let err = manager.check(&record, "development", "staging").unwrap_err();
        assert!(err.to_string().contains("status is failed"));
    }

    #[test]
    fn test_gated_stage_requests_then_honors_approval() {
        let (manager, approvals) = manager();
        let record = completed("staging");

        let PromotionCheck::AwaitingApproval { approval_id } =
            manager.check(&record, "staging", "production").unwrap()
        else {
            panic!("expected an approval request");
        };
        // A second check reuses the pending request
        assert_eq!(
            manager.check(&record, "staging", "production").unwrap(),
            PromotionCheck::AwaitingApproval {
                approval_id: approval_id.clone()
            }
        );

        approvals
            .submit_approval(&approval_id, "release-manager", ApprovalDecision::Approve, None)
            .unwrap();
        assert_eq!(
            manager.check(&record, "staging", "production").unwrap(),
            PromotionCheck::Ready {
                approval_id: Some(approval_id)
            }
        );
    }
}
