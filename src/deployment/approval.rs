//! # Approval Manager
//!
//! Approval gates for promotions. A request is decided by its listed approvers:
//! any rejection rejects it, `min_approvals` approvals approve it, and a request
//! still pending when its window closes expires. Expiry is applied lazily on
//! access and in bulk by [`ApprovalManager::expire_stale`].

use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::EventStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver: String,
    pub decision: ApprovalDecision,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub deployment_id: String,
    /// Promotion stage (target environment) being gated
    pub stage: String,
    pub approvers: Vec<String>,
    pub min_approvals: u32,
    pub status: ApprovalStatus,
    pub votes: Vec<ApprovalVote>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Approving votes, saturating at `u32::MAX`
    pub fn approvals(&self) -> u32 {
        let count = self
            .votes
            .iter()
            .filter(|v| v.decision == ApprovalDecision::Approve)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

#[derive(Debug)]
struct ApprovalEntry {
    request: ApprovalRequest,
    deadline: Instant,
}

#[derive(Debug)]
pub struct ApprovalManager {
    requests: DashMap<String, ApprovalEntry>,
    events: EventStore,
    default_timeout: Duration,
}

impl ApprovalManager {
    pub fn new(events: EventStore, default_timeout: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            events,
            default_timeout,
        }
    }

    pub fn request_approval(
        &self,
        deployment_id: &str,
        stage: &str,
        approvers: Vec<String>,
        min_approvals: u32,
        timeout: Option<Duration>,
    ) -> Result<ApprovalRequest> {
        if approvers.is_empty() {
            return Err(OrchestratorError::validation(
                "approval requests need at least one approver",
            ));
        }
        if min_approvals == 0 || min_approvals as usize > approvers.len() {
            return Err(OrchestratorError::validation(format!(
                "min_approvals must be within 1..={}",
                approvers.len()
            )));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment_id.to_string(),
            stage: stage.to_string(),
            approvers,
            min_approvals,
            status: ApprovalStatus::Pending,
            votes: Vec::new(),
            requested_at: now,
            expires_at,
            decided_at: None,
        };

        self.requests.insert(
            request.id.clone(),
            ApprovalEntry {
                request: request.clone(),
                deadline: Instant::now() + timeout,
            },
        );
        info!(
            approval_id = %request.id,
            deployment_id = %deployment_id,
            stage = %stage,
            "📝 Approval requested"
        );
        self.events.append(
            events::APPROVAL_REQUESTED,
            Some(deployment_id),
            json!({
                "approval_id": request.id,
                "stage": stage,
                "approvers": request.approvers,
                "min_approvals": min_approvals,
                "expires_at": expires_at.to_rfc3339(),
            }),
        );
        Ok(request)
    }

    pub fn submit_approval(
        &self,
        approval_id: &str,
        approver: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest> {
        let mut entry = self
            .requests
            .get_mut(approval_id)
            .ok_or_else(|| OrchestratorError::not_found("approval", approval_id))?;
        self.expire_if_due(&mut entry);

        let request = &mut entry.request;
        if request.status != ApprovalStatus::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "approval {approval_id} is already {}",
                request.status
            )));
        }
        if !request.approvers.iter().any(|a| a == approver) {
            return Err(OrchestratorError::validation(format!(
                "{approver} is not an approver for {approval_id}"
            )));
        }
        if request.votes.iter().any(|v| v.approver == approver) {
            return Err(OrchestratorError::InvalidState(format!(
                "{approver} already voted on {approval_id}"
            )));
        }

        request.votes.push(ApprovalVote {
            approver: approver.to_string(),
            decision,
            comment,
            at: Utc::now(),
        });

        let decided = match decision {
            ApprovalDecision::Reject => Some(ApprovalStatus::Rejected),
            ApprovalDecision::Approve if request.approvals() >= request.min_approvals => {
                Some(ApprovalStatus::Approved)
            }
            ApprovalDecision::Approve => None,
        };
        if let Some(status) = decided {
            request.status = status;
            request.decided_at = Some(Utc::now());
            info!(
                approval_id = %approval_id,
                deployment_id = %request.deployment_id,
                status = %status,
                "🗳️ Approval decided"
            );
            self.events.append(
                events::APPROVAL_DECIDED,
                Some(&request.deployment_id),
                json!({
                    "approval_id": approval_id,
                    "stage": request.stage,
                    "status": status,
                    "decided_by": approver,
                }),
            );
        }
        Ok(request.clone())
    }

    pub fn get(&self, approval_id: &str) -> Option<ApprovalRequest> {
        let mut entry = self.requests.get_mut(approval_id)?;
        self.expire_if_due(&mut entry);
        Some(entry.request.clone())
    }

    /// Most recent request for a deployment and stage
    pub fn find_for(&self, deployment_id: &str, stage: &str) -> Option<ApprovalRequest> {
        let id = self
            .requests
            .iter()
            .filter(|e| e.request.deployment_id == deployment_id && e.request.stage == stage)
            .max_by_key(|e| e.request.requested_at)
            .map(|e| e.request.id.clone())?;
        self.get(&id)
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        let mut pending: Vec<ApprovalRequest> = ids
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    /// Expire every pending request past its window; returns how many expired
    pub fn expire_stale(&self) -> usize {
        let mut expired = 0;
        for mut entry in self.requests.iter_mut() {
            if self.expire_if_due(&mut entry) {
                expired += 1;
            }
        }
        expired
    }

    fn expire_if_due(&self, entry: &mut ApprovalEntry) -> bool {
        if entry.request.status != ApprovalStatus::Pending || Instant::now() < entry.deadline {
            return false;
        }
        entry.request.status = ApprovalStatus::Expired;
        entry.request.decided_at = Some(Utc::now());
        info!(
            approval_id = %entry.request.id,
            deployment_id = %entry.request.deployment_id,
            "⌛ Approval expired"
        );
        self.events.append(
            events::APPROVAL_EXPIRED,
            Some(&entry.request.deployment_id),
            json!({ "approval_id": entry.request.id, "stage": entry.request.stage }),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ApprovalManager {
        ApprovalManager::new(EventStore::default(), Duration::from_secs(3600))
    }

    fn approvers() -> Vec<String> {
        vec!["alice".to_string(), "bob".to_string()]
    }

    #[test]
    fn test_min_approvals_reached() {
        let manager = manager();
        let request = manager
            .request_approval("dep-1", "production", approvers(), 2, None)
            .unwrap();

        let after_one = manager
            .submit_approval(&request.id, "alice", ApprovalDecision::Approve, None)
            .unwrap();
        assert_eq!(after_one.status, ApprovalStatus::Pending);

        let after_two = manager
            .submit_approval(&request.id, "bob", ApprovalDecision::Approve, Some("ship it".into()))
            .unwrap();
        assert_eq!(after_two.status, ApprovalStatus::Approved);
        assert!(after_two.decided_at.is_some());
    }

    #[test]
    fn test_approvals_count_only_approving_votes() {
        let manager = manager();
        let mut request = manager
            .request_approval("dep-1", "production", approvers(), 2, None)
            .unwrap();
        assert_eq!(request.approvals(), 0);

        for (approver, decision) in [
            ("alice", ApprovalDecision::Approve),
            ("bob", ApprovalDecision::Reject),
            ("carol", ApprovalDecision::Approve),
        ] {
            request.votes.push(ApprovalVote {
                approver: approver.to_string(),
                decision,
                comment: None,
                at: Utc::now(),
            });
        }
        assert_eq!(request.approvals(), 2);
    }

    #[test]
    fn test_single_rejection_rejects() {
        let manager = manager();
        let request = manager
            .request_approval("dep-1", "production", approvers(), 1, None)
            .unwrap();
        let decided = manager
            .submit_approval(&request.id, "bob", ApprovalDecision::Reject, None)
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert!(manager
            .submit_approval(&request.id, "alice", ApprovalDecision::Approve, None)
            .is_err());
    }

    #[test]
    fn test_unknown_approver_and_double_vote_rejected() {
        let manager = manager();
        let request = manager
            .request_approval("dep-1", "production", approvers(), 2, None)
            .unwrap();
        assert!(manager
            .submit_approval(&request.id, "mallory", ApprovalDecision::Approve, None)
            .is_err());
        manager
            .submit_approval(&request.id, "alice", ApprovalDecision::Approve, None)
            .unwrap();
        assert!(manager
            .submit_approval(&request.id, "alice", ApprovalDecision::Approve, None)
            .is_err());
    }

    #[test]
    fn test_invalid_request_shape() {
        let manager = manager();
        assert!(manager
            .request_approval("dep-1", "production", vec![], 1, None)
            .is_err());
        assert!(manager
            .request_approval("dep-1", "production", approvers(), 3, None)
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_window() {
        let store = EventStore::default();
        let manager = ApprovalManager::new(store.clone(), Duration::from_secs(3600));
        let request = manager
            .request_approval("dep-1", "production", approvers(), 1, Some(Duration::from_secs(60)))
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = manager
            .submit_approval(&request.id, "alice", ApprovalDecision::Approve, None)
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
        assert_eq!(
            manager.get(&request.id).unwrap().status,
            ApprovalStatus::Expired
        );
        assert_eq!(manager.expire_stale(), 0);
        assert_eq!(
            store
                .events_for_entity("dep-1")
                .iter()
                .filter(|e| e.event_type == events::APPROVAL_EXPIRED)
                .count(),
            1
        );
    }
}
