use crate::error::OrchestratorError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} via {event}")]
    InvalidTransition { from: String, event: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for OrchestratorError {
    fn from(error: StateMachineError) -> Self {
        match error {
            StateMachineError::GuardFailed { reason } => OrchestratorError::InvalidState(reason),
            StateMachineError::InvalidTransition { from, event } => {
                OrchestratorError::InvalidTransition { from, event }
            }
        }
    }
}
