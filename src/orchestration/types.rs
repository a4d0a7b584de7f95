//! # Orchestration Types
//!
//! Work request, result and queue status types shared by the workflow
//! orchestrator and its handlers.

use crate::error::{ErrorInfo, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Priority levels for work requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkPriority {
    /// Critical priority - process immediately
    Critical,
    /// High priority - process before normal work
    High,
    /// Normal priority - standard processing
    Normal,
    /// Low priority - process after normal work
    Low,
}

impl WorkPriority {
    /// All tiers, highest first
    pub const ALL: [WorkPriority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Queue tier index, 0 is served first
    pub fn tier(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Whether this priority ranks below `other`
    pub fn is_below(&self, other: WorkPriority) -> bool {
        self.tier() > other.tier()
    }
}

impl Default for WorkPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for WorkPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for WorkPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid work priority: {s}")),
        }
    }
}

/// Kind of work, selects the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkKind {
    Deployment,
    ComponentOp,
    Maintenance,
    /// Generation workflow carrying an opaque project-analysis payload
    Generation,
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "deployment"),
            Self::ComponentOp => write!(f, "component-op"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Generation => write!(f, "generation"),
        }
    }
}

/// A unit of work submitted to the orchestrator; immutable once queued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub kind: WorkKind,
    /// Passed through to the handler untouched
    pub payload: Value,
    pub priority: WorkPriority,
    pub submitted_at: DateTime<Utc>,
}

impl WorkRequest {
    pub fn new(kind: WorkKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            priority: WorkPriority::default(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: WorkPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Execution measurements attached to every result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkMetrics {
    /// Calls made to the handler, including the successful one
    pub attempts: u32,
    pub queue_wait_ms: u64,
    pub duration_ms: u64,
}

/// Outcome of a work request, produced exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub request_id: String,
    pub success: bool,
    pub data: Value,
    pub metrics: WorkMetrics,
    pub trace_id: String,
    pub error: Option<ErrorInfo>,
}

impl WorkResult {
    pub fn success(request_id: &str, trace_id: &str, data: Value, metrics: WorkMetrics) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: true,
            data,
            metrics,
            trace_id: trace_id.to_string(),
            error: None,
        }
    }

    pub fn failure(
        request_id: &str,
        trace_id: &str,
        error: &OrchestratorError,
        metrics: WorkMetrics,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: false,
            data: Value::Null,
            metrics,
            trace_id: trace_id.to_string(),
            error: Some(ErrorInfo::from(error)),
        }
    }
}

/// Handle returned on submission; the result arrives asynchronously
#[derive(Debug)]
pub struct WorkTicket {
    pub request_id: String,
    pub trace_id: String,
    pub priority: WorkPriority,
    receiver: oneshot::Receiver<WorkResult>,
}

impl WorkTicket {
    pub(crate) fn new(
        request_id: String,
        trace_id: String,
        priority: WorkPriority,
        receiver: oneshot::Receiver<WorkResult>,
    ) -> Self {
        Self {
            request_id,
            trace_id,
            priority,
            receiver,
        }
    }

    /// Wait for the result of the request
    pub async fn wait(self) -> Result<WorkResult> {
        self.receiver.await.map_err(|_| {
            OrchestratorError::InvalidState(format!(
                "work request {} was dropped before completion",
                self.request_id
            ))
        })
    }

    /// Result if it is already available
    pub fn try_result(&mut self) -> Option<WorkResult> {
        self.receiver.try_recv().ok()
    }
}

/// Snapshot of the work queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: usize,
    /// Requests dequeued and currently executing
    pub processing: usize,
    pub by_priority: HashMap<WorkPriority, usize>,
    pub max_queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_tiers_and_parsing() {
        assert!(WorkPriority::Low.is_below(WorkPriority::High));
        assert!(!WorkPriority::Critical.is_below(WorkPriority::High));
        assert!(!WorkPriority::High.is_below(WorkPriority::High));
        assert_eq!("critical".parse::<WorkPriority>(), Ok(WorkPriority::Critical));
        assert!("urgent".parse::<WorkPriority>().is_err());
    }

    #[test]
    fn test_work_request_deserializes_from_wire_form() {
        let request: WorkRequest = serde_json::from_value(json!({
            "id": "req-1",
            "kind": "component-op",
            "payload": {"component": "api"},
            "priority": "high",
            "submitted_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(request.kind, WorkKind::ComponentOp);
        assert_eq!(request.priority, WorkPriority::High);
    }

    #[test]
    fn test_failure_result_carries_category() {
        let err = OrchestratorError::CircuitOpen {
            dependency: "registry".into(),
        };
        let result = WorkResult::failure("req-1", "trace-1", &err, WorkMetrics::default());
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().category,
            crate::error::ErrorCategory::CircuitOpen
        );
    }
}
