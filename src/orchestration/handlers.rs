//! # Work Handlers
//!
//! Collaborator boundary for executing dequeued work. One handler per
//! [`WorkKind`]; each names the dependency key its calls are guarded by.

use super::types::{WorkKind, WorkRequest};
use crate::deployment::{DeploymentConfig, DeploymentOrchestrator};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Executes one kind of work request
#[async_trait]
pub trait WorkHandler: Send + Sync + fmt::Debug {
    /// Circuit breaker key for calls made on behalf of `request`
    fn dependency_key(&self, request: &WorkRequest) -> String;

    /// Perform the work; transient errors are retried by the caller
    async fn handle(&self, request: &WorkRequest) -> Result<Value>;
}

/// Delegates `deployment` work requests to the deployment orchestrator
#[derive(Debug, Clone)]
pub struct DeploymentWorkHandler {
    deployments: Arc<DeploymentOrchestrator>,
}

impl DeploymentWorkHandler {
    pub fn new(deployments: Arc<DeploymentOrchestrator>) -> Self {
        Self { deployments }
    }
}

#[async_trait]
impl WorkHandler for DeploymentWorkHandler {
    fn dependency_key(&self, request: &WorkRequest) -> String {
        let environment = request
            .payload
            .get("environment")
            .and_then(Value::as_str)
            .unwrap_or("default");
        format!("deployment:{environment}")
    }

    async fn handle(&self, request: &WorkRequest) -> Result<Value> {
        let config: DeploymentConfig = serde_json::from_value(request.payload.clone())
            .map_err(|e| OrchestratorError::validation(format!("invalid deployment payload: {e}")))?;

        let result = self.deployments.create_deployment(config).await;
        if result.success {
            return Ok(serde_json::to_value(&result)?);
        }

        match result.category {
            Some(ErrorCategory::Validation) | None => {
                Err(OrchestratorError::validation(result.message))
            }
            Some(_) => Err(OrchestratorError::strategy(
                result.deployment_id,
                result.message,
            )),
        }
    }
}

/// Handler backed by an async closure, for embedding collaborators
pub struct FnWorkHandler<F> {
    dependency: String,
    handler: F,
}

impl<F> FnWorkHandler<F> {
    pub fn new<Fut>(dependency: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WorkRequest) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Value>> + Send,
    {
        Self {
            dependency: dependency.into(),
            handler,
        }
    }
}

impl<F> fmt::Debug for FnWorkHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWorkHandler")
            .field("dependency", &self.dependency)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> WorkHandler for FnWorkHandler<F>
where
    F: Fn(WorkRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value>> + Send,
{
    fn dependency_key(&self, _request: &WorkRequest) -> String {
        self.dependency.clone()
    }

    async fn handle(&self, request: &WorkRequest) -> Result<Value> {
        (self.handler)(request.clone()).await
    }
}

/// Handlers keyed by work kind
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: std::collections::HashMap<WorkKind, Arc<dyn WorkHandler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, kind: WorkKind, handler: Arc<dyn WorkHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: WorkKind) -> Option<Arc<dyn WorkHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<WorkKind> {
        self.handlers.keys().copied().collect()
    }
}
