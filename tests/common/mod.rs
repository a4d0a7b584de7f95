//! Shared fixtures for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use orchestrator_core::config::{
    BackoffConfig, CircuitBreakerComponentConfig, CircuitBreakerConfig, QueueConfig,
};
use orchestrator_core::deployment::InMemoryTarget;
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::orchestration::{CoreCollaborators, OrchestrationCore, WorkflowOrchestrator};
use orchestrator_core::resilience::CircuitBreakerManager;
use orchestrator_core::scaling::{HealthProbe, ProbeMethod, ServiceInstance};
use orchestrator_core::{EventStore, OrchestratorConfig, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Probe whose answer per instance is flipped by the test
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    failing: Mutex<HashMap<String, bool>>,
}

impl ScriptedProbe {
    pub fn set_failing(&self, instance_id: &str, failing: bool) {
        self.failing.lock().insert(instance_id.to_string(), failing);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, instance: &ServiceInstance, _method: ProbeMethod) -> Result<()> {
        if self.failing.lock().get(&instance.id).copied().unwrap_or(false) {
            return Err(OrchestratorError::HealthCheck {
                instance_id: instance.id.clone(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Core wired to an in-memory target and a scripted probe
pub fn core_with(
    config: OrchestratorConfig,
    target: Arc<InMemoryTarget>,
    probe: Arc<ScriptedProbe>,
) -> OrchestrationCore {
    OrchestrationCore::with_collaborators(
        config,
        CoreCollaborators::default()
            .with_target(target)
            .with_probe(probe),
    )
    .unwrap()
}

pub struct WorkflowFixture {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub events: EventStore,
}

/// Orchestrator with jitter-free backoff (100ms doubling) and a 30s breaker cooldown
pub fn workflow(max_queue_depth: usize, max_attempts: u32, failure_threshold: u32) -> WorkflowFixture {
    let events = EventStore::default();
    let breakers = Arc::new(CircuitBreakerManager::from_config(
        &CircuitBreakerConfig {
            enabled: true,
            default_config: CircuitBreakerComponentConfig {
                failure_threshold,
                timeout_seconds: 30,
                success_threshold: 1,
            },
            component_configs: HashMap::new(),
        },
        events.clone(),
    ));
    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        QueueConfig {
            max_queue_depth,
            ..QueueConfig::default()
        },
        BackoffConfig {
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts,
            jitter_enabled: false,
            jitter_max_percentage: 0.0,
        },
        Arc::clone(&breakers),
        events.clone(),
    ));
    WorkflowFixture {
        orchestrator,
        breakers,
        events,
    }
}
