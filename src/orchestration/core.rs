//! # Orchestration Core
//!
//! Single entry point that wires the event store, circuit breakers, workflow
//! orchestrator, deployment orchestrator and scaling manager from one
//! [`OrchestratorConfig`], and exposes every public operation.
//!
//! ## Bootstrap
//!
//! - [`OrchestrationCore::new`] loads layered configuration for the detected environment
//! - [`OrchestrationCore::from_config`] wraps an already loaded [`ConfigManager`]
//! - [`OrchestrationCore::with_collaborators`] injects the deployment target,
//!   health probe and scaling executor (embedding and tests)
//!
//! Deployment work requests are delegated to the deployment orchestrator
//! through a [`DeploymentWorkHandler`] registered at construction.

use super::handlers::{DeploymentWorkHandler, WorkHandler};
use super::types::{QueueStatus, WorkKind, WorkRequest, WorkTicket};
use super::workflow_orchestrator::WorkflowOrchestrator;
use crate::config::{ConfigManager, OrchestratorConfig};
use crate::deployment::{
    DeploymentConfig, DeploymentFilter, DeploymentOrchestrator, DeploymentRecord,
    DeploymentResult, DeploymentTarget, InMemoryTarget, PromotionResult, ValidationResult,
};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventFilter, EventStore, EventSubscription, IncomingEvent, SystemEvent};
use crate::resilience::{CircuitBreakerManager, CircuitBreakerState, CircuitState};
use crate::scaling::{
    ComponentScalingStatus, HealthProbe, NetworkHealthProbe, NoopScalingExecutor, ScalingExecutor,
    ScalingManager, ScalingMetrics, ScalingResult, SystemHealth,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// External systems the core talks to
#[derive(Debug, Clone)]
pub struct CoreCollaborators {
    pub target: Arc<dyn DeploymentTarget>,
    /// Network probes built from the health check timeout when absent
    pub probe: Option<Arc<dyn HealthProbe>>,
    pub executor: Arc<dyn ScalingExecutor>,
}

impl Default for CoreCollaborators {
    fn default() -> Self {
        Self {
            target: Arc::new(InMemoryTarget::new()),
            probe: None,
            executor: Arc::new(NoopScalingExecutor),
        }
    }
}

impl CoreCollaborators {
    pub fn with_target(mut self, target: Arc<dyn DeploymentTarget>) -> Self {
        self.target = target;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ScalingExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

/// The orchestration core every entry point uses
#[derive(Debug)]
pub struct OrchestrationCore {
    config: OrchestratorConfig,
    events: EventStore,
    breakers: Arc<CircuitBreakerManager>,
    workflow: Arc<WorkflowOrchestrator>,
    deployments: Arc<DeploymentOrchestrator>,
    scaling: Arc<ScalingManager>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestrationCore {
    /// Load configuration for the detected environment and bootstrap
    pub fn new() -> Result<Self> {
        info!("🔧 Initializing OrchestrationCore with auto-detected environment configuration");
        let config_manager = ConfigManager::load()?;
        Self::from_config(config_manager)
    }

    pub fn from_config(config_manager: Arc<ConfigManager>) -> Result<Self> {
        Self::with_collaborators(config_manager.config().clone(), CoreCollaborators::default())
    }

    pub fn with_collaborators(
        config: OrchestratorConfig,
        collaborators: CoreCollaborators,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            environment = %config.environment,
            circuit_breakers = config.circuit_breakers.enabled,
            "🏗️ Creating orchestration components"
        );

        let events = EventStore::new(config.events.channel_capacity);
        let breakers = Arc::new(CircuitBreakerManager::from_config(
            &config.circuit_breakers,
            events.clone(),
        ));
        let workflow = Arc::new(WorkflowOrchestrator::new(
            config.queue.clone(),
            config.backoff.clone(),
            Arc::clone(&breakers),
            events.clone(),
        ));
        let deployments = Arc::new(DeploymentOrchestrator::new(
            collaborators.target,
            &config.deployment,
            events.clone(),
        ));
        let probe = match collaborators.probe {
            Some(probe) => probe,
            None => Arc::new(NetworkHealthProbe::new(config.health_checks.timeout())?),
        };
        let scaling = Arc::new(ScalingManager::with_collaborators(
            &config,
            events.clone(),
            probe,
            collaborators.executor,
        )?);

        workflow.register_handler(
            WorkKind::Deployment,
            Arc::new(DeploymentWorkHandler::new(Arc::clone(&deployments))),
        );

        info!("✅ OrchestrationCore components created");
        Ok(Self {
            config,
            events,
            breakers,
            workflow,
            deployments,
            scaling,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn workflow(&self) -> &Arc<WorkflowOrchestrator> {
        &self.workflow
    }

    pub fn deployments(&self) -> &Arc<DeploymentOrchestrator> {
        &self.deployments
    }

    pub fn scaling(&self) -> &Arc<ScalingManager> {
        &self.scaling
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    // ===== Work requests =====

    /// Install the collaborator for a work kind (component ops, maintenance, generation)
    pub fn register_handler(&self, kind: WorkKind, handler: Arc<dyn WorkHandler>) {
        self.workflow.register_handler(kind, handler);
    }

    pub fn submit_work_request(&self, request: WorkRequest) -> Result<WorkTicket> {
        self.workflow.submit(request)
    }

    pub fn handle_event(&self, event: IncomingEvent) -> SystemEvent {
        self.workflow.handle_event(event)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.workflow.queue_status()
    }

    pub fn get_circuit_breaker_status(&self) -> HashMap<String, CircuitBreakerState> {
        self.breakers.status()
    }

    // ===== Deployments =====

    pub async fn create_deployment(&self, config: DeploymentConfig) -> DeploymentResult {
        self.deployments.create_deployment(config).await
    }

    pub fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        self.deployments.get_deployment_status(deployment_id)
    }

    pub fn list_deployments(&self, filter: &DeploymentFilter) -> Vec<DeploymentRecord> {
        self.deployments.list_deployments(filter)
    }

    pub async fn validate_deployment(&self, deployment_id: &str) -> Result<ValidationResult> {
        self.deployments.validate_deployment(deployment_id).await
    }

    pub async fn rollback_deployment(&self, deployment_id: &str) -> DeploymentResult {
        self.deployments.rollback_deployment(deployment_id).await
    }

    pub async fn promote_deployment(
        &self,
        deployment_id: &str,
        from: &str,
        to: &str,
    ) -> PromotionResult {
        self.deployments
            .promote_deployment(deployment_id, from, to)
            .await
    }

    pub fn pause_deployment(&self, deployment_id: &str) -> DeploymentResult {
        self.deployments.pause_deployment(deployment_id)
    }

    pub fn resume_deployment(&self, deployment_id: &str) -> DeploymentResult {
        self.deployments.resume_deployment(deployment_id)
    }

    pub async fn await_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        self.deployments.await_completion(deployment_id).await
    }

    // ===== Scaling =====

    pub fn add_metrics(&self, component_id: &str, metrics: ScalingMetrics) -> Result<()> {
        self.scaling.add_metrics(component_id, metrics)
    }

    pub async fn manual_scale(&self, component_id: &str, target: u32, reason: &str) -> ScalingResult {
        self.scaling.manual_scale(component_id, target, reason).await
    }

    pub fn get_scaling_status(&self, component_id: &str) -> Result<ComponentScalingStatus> {
        self.scaling.get_scaling_status(component_id)
    }

    /// Instance health and bottlenecks, with open breakers folded in
    pub fn get_system_health(&self) -> SystemHealth {
        let open = self
            .breakers
            .status()
            .into_iter()
            .filter(|(_, state)| state.state == CircuitState::Open)
            .map(|(key, _)| key)
            .collect();
        self.scaling.get_system_health().with_open_circuits(open)
    }

    // ===== Events =====

    pub fn get_event_history(&self, since: Option<DateTime<Utc>>) -> Vec<SystemEvent> {
        self.events.get_history(since)
    }

    pub fn query_events(&self, filter: &EventFilter) -> Vec<SystemEvent> {
        self.events.query(filter)
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.events.subscribe(filter)
    }

    // ===== Lifecycle =====

    /// Start queue processing, scaling evaluation and health checking
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return Err(OrchestratorError::InvalidState(
                "orchestration core is already running".to_string(),
            ));
        }
        background.push(self.workflow.start());
        background.extend(self.scaling.start());
        info!(loops = background.len(), "🚀 Orchestration core started");
        Ok(())
    }

    /// Stop every background loop and wait for them to exit
    pub async fn shutdown(&self) {
        self.workflow.shutdown();
        self.scaling.shutdown();
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("🛑 Orchestration core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::events;
    use crate::orchestration::types::WorkPriority;
    use crate::scaling::{HealthLevel, ProbeMethod, ServiceInstance};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug)]
    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _: &ServiceInstance, _: ProbeMethod) -> Result<()> {
            Ok(())
        }
    }

    fn core() -> OrchestrationCore {
        OrchestrationCore::with_collaborators(
            OrchestratorConfig::default(),
            CoreCollaborators::default().with_probe(Arc::new(AlwaysHealthy)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_deployment_work_request_is_delegated() {
        let core = core();
        let config = DeploymentConfig::new("rolling", "staging", "api:2");
        let payload = serde_json::to_value(&config).unwrap();
        core.submit_work_request(
            WorkRequest::new(WorkKind::Deployment, payload).with_priority(WorkPriority::High),
        )
        .unwrap();

        let result = core.workflow().process_next().await.unwrap();
        assert!(result.success, "{:?}", result.error);
        let deployment_id = result.data["deployment_id"].as_str().unwrap().to_string();
        assert!(core.get_deployment_status(&deployment_id).is_ok());

        let history = core.get_event_history(None);
        assert!(history.iter().any(|e| e.event_type == events::WORK_COMPLETED));
        assert!(history.iter().any(|e| e.event_type == events::DEPLOYMENT_CREATED));
        assert_eq!(core.get_queue_status().size, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_degrades_system_health() {
        let core = core();
        assert_eq!(core.get_system_health().overall, HealthLevel::Healthy);

        for _ in 0..core.config().circuit_breakers.default_config.failure_threshold {
            core.handle_event(IncomingEvent::new(
                events::COMPONENT_FAILURE,
                json!({ "dependency": "artifact-store" }),
            ));
        }

        let breakers = core.get_circuit_breaker_status();
        assert_eq!(breakers["artifact-store"].state, CircuitState::Open);
        let health = core.get_system_health();
        assert_eq!(health.overall, HealthLevel::Warning);
        assert_eq!(health.open_circuits, vec!["artifact-store".to_string()]);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_shutdown_joins() {
        let core = core();
        core.start().unwrap();
        assert!(core.start().is_err());
        core.shutdown().await;
        assert!(core.workflow().is_shutdown());
    }

    #[tokio::test]
    async fn test_unknown_entities_surface_not_found() {
        let core = core();
        assert!(core.get_scaling_status("ghost").is_err());
        let result = core.rollback_deployment("ghost").await;
        assert!(!result.success);
        assert_eq!(
            result.category,
            Some(crate::error::ErrorCategory::NotFound)
        );
    }
}
