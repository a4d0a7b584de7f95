use super::{
    errors::{StateMachineError, StateMachineResult},
    events::DeploymentEvent,
    states::DeploymentStatus,
};
use crate::constants::events;
use crate::events::EventStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// One applied transition, kept for the deployment's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
    pub event: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Lifecycle state machine for a single deployment record
///
/// Owned by the deployment's record lock, so at most one transition is applied
/// at a time per deployment.
#[derive(Debug)]
pub struct DeploymentStateMachine {
    deployment_id: String,
    current: DeploymentStatus,
    /// Whether the strategy supports pause/resume
    pausable: bool,
    transitions: Vec<StateTransition>,
    events: EventStore,
}

impl DeploymentStateMachine {
    pub fn new(deployment_id: impl Into<String>, pausable: bool, events: EventStore) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            current: DeploymentStatus::default(),
            pausable,
            transitions: Vec::new(),
            events,
        }
    }

    pub fn current_state(&self) -> DeploymentStatus {
        self.current
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Attempt to transition the deployment state
    pub fn transition(&mut self, event: DeploymentEvent) -> StateMachineResult<DeploymentStatus> {
        let current_state = self.current;
        let target_state = self.determine_target_state(current_state, &event)?;

        self.check_guards(current_state, target_state, &event)?;

        self.current = target_state;
        self.transitions.push(StateTransition {
            from: current_state,
            to: target_state,
            event: event.event_type().to_string(),
            reason: event.error_message().map(str::to_string),
            at: Utc::now(),
        });

        self.execute_actions(current_state, target_state, &event);

        Ok(target_state)
    }

    /// Determine the target state based on current state and event
    fn determine_target_state(
        &self,
        current_state: DeploymentStatus,
        event: &DeploymentEvent,
    ) -> StateMachineResult<DeploymentStatus> {
        use DeploymentStatus as S;

        let target = match (current_state, event) {
            // Forward progress
            (S::Pending, DeploymentEvent::StartValidation) => S::Validating,
            (S::Validating, DeploymentEvent::StartExecution) => S::Executing,
            (S::Executing, DeploymentEvent::Complete) => S::Completed,

            // Pause sub-cycle
            (S::Executing, DeploymentEvent::Pause) => S::Paused,
            (S::Paused, DeploymentEvent::Resume) => S::Executing,

            // Failure transitions
            (S::Pending, DeploymentEvent::Fail(_)) => S::Failed,
            (S::Validating, DeploymentEvent::Fail(_)) => S::Failed,
            (S::Executing, DeploymentEvent::Fail(_)) => S::Failed,
            (S::Paused, DeploymentEvent::Fail(_)) => S::Failed,

            // Rollback, automatic or manual
            (from, DeploymentEvent::RollBack) if from.can_roll_back() => S::RolledBack,

            // Invalid transitions
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Check guard conditions for the transition
    fn check_guards(
        &self,
        _current_state: DeploymentStatus,
        target_state: DeploymentStatus,
        event: &DeploymentEvent,
    ) -> StateMachineResult<()> {
        let pausing =
            matches!(event, DeploymentEvent::Pause) && target_state == DeploymentStatus::Paused;
        if pausing && !self.pausable {
            return Err(StateMachineError::GuardFailed {
                reason: format!(
                    "deployment {} uses a strategy that cannot be paused",
                    self.deployment_id
                ),
            });
        }
        Ok(())
    }

    /// Record the transition in the event store
    fn execute_actions(
        &self,
        from_state: DeploymentStatus,
        to_state: DeploymentStatus,
        event: &DeploymentEvent,
    ) {
        debug!(
            deployment_id = %self.deployment_id,
            from = %from_state,
            to = %to_state,
            event = event.event_type(),
            "Deployment state transition"
        );

        self.events.append(
            events::DEPLOYMENT_STATUS_CHANGED,
            Some(&self.deployment_id),
            json!({
                "from": from_state.to_string(),
                "to": to_state.to_string(),
                "event": event.event_type(),
                "reason": event.error_message(),
            }),
        );

        let lifecycle_event = match (to_state, event) {
            (DeploymentStatus::Paused, _) => Some(events::DEPLOYMENT_PAUSED),
            (DeploymentStatus::Executing, DeploymentEvent::Resume) => {
                Some(events::DEPLOYMENT_RESUMED)
            }
            (DeploymentStatus::Completed, _) => Some(events::DEPLOYMENT_COMPLETED),
            (DeploymentStatus::Failed, _) => Some(events::DEPLOYMENT_FAILED),
            (DeploymentStatus::RolledBack, _) => Some(events::DEPLOYMENT_ROLLED_BACK),
            _ => None,
        };
        if let Some(event_type) = lifecycle_event {
            self.events.append(
                event_type,
                Some(&self.deployment_id),
                json!({ "reason": event.error_message() }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(pausable: bool) -> (DeploymentStateMachine, EventStore) {
        let store = EventStore::default();
        (
            DeploymentStateMachine::new("dep-1", pausable, store.clone()),
            store,
        )
    }

    #[test]
    fn test_happy_path_with_pause_cycle() {
        let (mut sm, store) = machine(true);
        assert_eq!(sm.current_state(), DeploymentStatus::Pending);

        sm.transition(DeploymentEvent::StartValidation).unwrap();
        sm.transition(DeploymentEvent::StartExecution).unwrap();
        assert_eq!(
            sm.transition(DeploymentEvent::Pause).unwrap(),
            DeploymentStatus::Paused
        );
        sm.transition(DeploymentEvent::Resume).unwrap();
        assert_eq!(
            sm.transition(DeploymentEvent::Complete).unwrap(),
            DeploymentStatus::Completed
        );

        assert_eq!(sm.transitions().len(), 5);
        let types: Vec<String> = store
            .events_for_entity("dep-1")
            .into_iter()
            .map(|e| e.event_type)
            .filter(|t| t != events::DEPLOYMENT_STATUS_CHANGED)
            .collect();
        assert_eq!(
            types,
            vec![
                events::DEPLOYMENT_PAUSED,
                events::DEPLOYMENT_RESUMED,
                events::DEPLOYMENT_COMPLETED
            ]
        );
    }

    #[test]
    fn test_unpausable_strategy_rejects_pause() {
        let (mut sm, _) = machine(false);
        sm.transition(DeploymentEvent::StartValidation).unwrap();
        sm.transition(DeploymentEvent::StartExecution).unwrap();

        let err = sm.transition(DeploymentEvent::Pause).unwrap_err();
        assert!(matches!(err, StateMachineError::GuardFailed { .. }));
        assert_eq!(sm.current_state(), DeploymentStatus::Executing);
    }

    #[test]
    fn test_resume_requires_paused() {
        let (mut sm, _) = machine(true);
        sm.transition(DeploymentEvent::StartValidation).unwrap();
        sm.transition(DeploymentEvent::StartExecution).unwrap();
        assert!(sm.transition(DeploymentEvent::Resume).is_err());
    }

    #[test]
    fn test_failed_can_be_rolled_back_manually() {
        let (mut sm, _) = machine(true);
        sm.transition(DeploymentEvent::Fail("invalid strategy".into()))
            .unwrap();
        assert_eq!(sm.current_state(), DeploymentStatus::Failed);
        assert!(sm.transition(DeploymentEvent::StartValidation).is_err());
        assert_eq!(
            sm.transition(DeploymentEvent::RollBack).unwrap(),
            DeploymentStatus::RolledBack
        );
        assert!(sm.transition(DeploymentEvent::RollBack).is_err());
    }
}
