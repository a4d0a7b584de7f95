// Deployment lifecycle state machine
//
// States, events and the transition table are kept separate so the deployment
// orchestrator only ever drives transitions through `DeploymentStateMachine`.

pub mod deployment_state_machine;
pub mod errors;
pub mod events;
pub mod states;

// Re-export main types for convenient access
pub use deployment_state_machine::{DeploymentStateMachine, StateTransition};
pub use errors::{StateMachineError, StateMachineResult};
pub use events::DeploymentEvent;
pub use states::DeploymentStatus;
