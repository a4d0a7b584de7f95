use serde::{Deserialize, Serialize};

/// Events that can trigger deployment state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DeploymentEvent {
    /// Begin pre-deployment validation
    StartValidation,
    /// Validation passed, begin the strategy
    StartExecution,
    /// Suspend a pausable strategy
    Pause,
    /// Continue a paused strategy
    Resume,
    /// Strategy and post-deployment checks finished
    Complete,
    /// Stop with an error message
    Fail(String),
    /// Rollback plan executed successfully
    RollBack,
}

impl DeploymentEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StartValidation => "start_validation",
            Self::StartExecution => "start_execution",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::RollBack => "roll_back",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}
