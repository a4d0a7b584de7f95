//! # Deployment Targets
//!
//! The infrastructure a deployment acts on: environments, traffic routing and
//! instances. Cloud SDKs and schedulers plug in behind [`DeploymentTarget`];
//! [`InMemoryTarget`] keeps everything in process for embedding and tests.

use super::types::ObservedMetrics;
use super::validation::CheckSpec;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// An instance running in a deployment environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInstance {
    pub id: String,
    pub artifact: String,
}

/// Raw outcome of a single check invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    /// 0.0 to 1.0
    pub score: f64,
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: 1.0,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            message: message.into(),
        }
    }
}

/// Share of an environment's traffic routed to an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub artifact: String,
    pub percentage: u8,
}

/// Infrastructure operations used by deployment strategies and rollbacks
#[async_trait]
pub trait DeploymentTarget: Send + Sync + fmt::Debug {
    /// Infrastructure readiness probe run before execution
    async fn check_readiness(&self, environment: &str) -> Result<()>;

    /// Whether `artifact` can still be deployed (used for rollback feasibility)
    async fn artifact_available(&self, artifact: &str) -> Result<bool>;

    /// Bring up a parallel environment slot running `artifact`
    async fn provision_environment(&self, environment: &str, slot: &str, artifact: &str)
        -> Result<()>;

    async fn decommission_environment(&self, environment: &str, slot: &str) -> Result<()>;

    /// Route `percentage` of traffic to `artifact`, the rest to the prior version
    async fn set_traffic_split(&self, environment: &str, artifact: &str, percentage: u8)
        -> Result<()>;

    /// Launch `count` instances of `artifact`, returning their ids
    async fn launch_instances(&self, environment: &str, artifact: &str, count: u32)
        -> Result<Vec<String>>;

    async fn terminate_instances(&self, environment: &str, instance_ids: &[String]) -> Result<()>;

    async fn list_instances(&self, environment: &str) -> Result<Vec<TargetInstance>>;

    /// Current metrics for traffic served by `artifact`
    async fn observe_metrics(&self, environment: &str, artifact: &str) -> Result<ObservedMetrics>;

    /// Run a named smoke, health, performance or security check
    async fn run_check(
        &self,
        environment: &str,
        artifact: &str,
        check: &CheckSpec,
    ) -> Result<CheckOutcome>;
}

#[derive(Debug, Default)]
struct TargetState {
    instances: HashMap<String, Vec<TargetInstance>>,
    /// Instance count each environment is expected to serve with
    desired: HashMap<String, u32>,
    max_unavailable: HashMap<String, u32>,
    traffic: HashMap<String, TrafficSplit>,
    slots: HashSet<(String, String)>,
    metrics: HashMap<String, ObservedMetrics>,
    unavailable_artifacts: HashSet<String>,
    failing_checks: HashSet<String>,
    unready_environments: HashSet<String>,
    fail_launches: bool,
    next_id: u64,
    operations: Vec<String>,
}

impl TargetState {
    fn observe_availability(&mut self, environment: &str) {
        let running = self
            .instances
            .get(environment)
            .map_or(0, |list| list.len() as u32);
        let desired = self.desired.get(environment).copied().unwrap_or(0);
        let unavailable = desired.saturating_sub(running);
        let max = self
            .max_unavailable
            .entry(environment.to_string())
            .or_insert(0);
        *max = (*max).max(unavailable);
    }
}

/// Process-local target that records every operation
pub struct InMemoryTarget {
    state: Mutex<TargetState>,
    default_metrics: ObservedMetrics,
    latency: Mutex<Duration>,
}

impl fmt::Debug for InMemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryTarget")
            .field("environments", &state.instances.len())
            .field("operations", &state.operations.len())
            .finish()
    }
}

impl Default for InMemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TargetState::default()),
            default_metrics: ObservedMetrics::default()
                .with_error_rate(0.001)
                .with_response_time(120.0),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Seed `count` running instances of `artifact`
    pub fn with_instances(self, environment: &str, artifact: &str, count: u32) -> Self {
        {
            let mut state = self.state.lock();
            for _ in 0..count {
                state.next_id += 1;
                let id = format!("{environment}-{}", state.next_id);
                state
                    .instances
                    .entry(environment.to_string())
                    .or_default()
                    .push(TargetInstance {
                        id,
                        artifact: artifact.to_string(),
                    });
            }
            *state.desired.entry(environment.to_string()).or_insert(0) += count;
        }
        self
    }

    pub fn set_metrics(&self, artifact: &str, metrics: ObservedMetrics) {
        self.state.lock().metrics.insert(artifact.to_string(), metrics);
    }

    pub fn mark_artifact_unavailable(&self, artifact: &str) {
        self.state
            .lock()
            .unavailable_artifacts
            .insert(artifact.to_string());
    }

    pub fn fail_check(&self, check_name: &str) {
        self.state.lock().failing_checks.insert(check_name.to_string());
    }

    pub fn fail_readiness(&self, environment: &str) {
        self.state
            .lock()
            .unready_environments
            .insert(environment.to_string());
    }

    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().fail_launches = fail;
    }

    /// Delay applied to instance launches and terminations
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn instances(&self, environment: &str) -> Vec<TargetInstance> {
        self.state
            .lock()
            .instances
            .get(environment)
            .cloned()
            .unwrap_or_default()
    }

    pub fn traffic(&self, environment: &str) -> Option<TrafficSplit> {
        self.state.lock().traffic.get(environment).cloned()
    }

    /// Largest shortfall against the desired instance count seen so far
    pub fn max_unavailable_observed(&self, environment: &str) -> u32 {
        self.state
            .lock()
            .max_unavailable
            .get(environment)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_provisioned(&self, environment: &str, slot: &str) -> bool {
        self.state
            .lock()
            .slots
            .contains(&(environment.to_string(), slot.to_string()))
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DeploymentTarget for InMemoryTarget {
    async fn check_readiness(&self, environment: &str) -> Result<()> {
        let state = self.state.lock();
        if state.unready_environments.contains(environment) {
            return Err(OrchestratorError::transient(
                format!("target:{environment}"),
                "infrastructure not ready",
            ));
        }
        Ok(())
    }

    async fn artifact_available(&self, artifact: &str) -> Result<bool> {
        Ok(!self.state.lock().unavailable_artifacts.contains(artifact))
    }

    async fn provision_environment(
        &self,
        environment: &str,
        slot: &str,
        artifact: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .slots
            .insert((environment.to_string(), slot.to_string()));
        state
            .operations
            .push(format!("provision {environment}/{slot} {artifact}"));
        Ok(())
    }

    async fn decommission_environment(&self, environment: &str, slot: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .slots
            .remove(&(environment.to_string(), slot.to_string()));
        state
            .operations
            .push(format!("decommission {environment}/{slot}"));
        Ok(())
    }

    async fn set_traffic_split(
        &self,
        environment: &str,
        artifact: &str,
        percentage: u8,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.traffic.insert(
            environment.to_string(),
            TrafficSplit {
                artifact: artifact.to_string(),
                percentage: percentage.min(100),
            },
        );
        state
            .operations
            .push(format!("traffic {environment} {artifact}={percentage}%"));
        Ok(())
    }

    async fn launch_instances(
        &self,
        environment: &str,
        artifact: &str,
        count: u32,
    ) -> Result<Vec<String>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.fail_launches {
            return Err(OrchestratorError::transient(
                format!("target:{environment}"),
                format!("failed to launch {count} instances of {artifact}"),
            ));
        }

        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            state.next_id += 1;
            let id = format!("{environment}-{}", state.next_id);
            state
                .instances
                .entry(environment.to_string())
                .or_default()
                .push(TargetInstance {
                    id: id.clone(),
                    artifact: artifact.to_string(),
                });
            ids.push(id);
        }
        let running = state.instances.get(environment).map_or(0, Vec::len) as u32;
        let desired = state.desired.entry(environment.to_string()).or_insert(0);
        // First launch into an empty environment defines its size
        if *desired == 0 {
            *desired = running;
        }
        state
            .operations
            .push(format!("launch {environment} {artifact} x{count}"));
        state.observe_availability(environment);
        Ok(ids)
    }

    async fn terminate_instances(&self, environment: &str, instance_ids: &[String]) -> Result<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(list) = state.instances.get_mut(environment) {
            list.retain(|instance| !instance_ids.contains(&instance.id));
        }
        state
            .operations
            .push(format!("terminate {environment} x{}", instance_ids.len()));
        state.observe_availability(environment);
        Ok(())
    }

    async fn list_instances(&self, environment: &str) -> Result<Vec<TargetInstance>> {
        Ok(self.instances(environment))
    }

    async fn observe_metrics(&self, _environment: &str, artifact: &str) -> Result<ObservedMetrics> {
        let state = self.state.lock();
        Ok(state
            .metrics
            .get(artifact)
            .cloned()
            .unwrap_or_else(|| self.default_metrics.clone()))
    }

    async fn run_check(
        &self,
        environment: &str,
        _artifact: &str,
        check: &CheckSpec,
    ) -> Result<CheckOutcome> {
        let state = self.state.lock();
        if state.failing_checks.contains(&check.name) {
            return Ok(CheckOutcome::fail(format!(
                "{} failed in {environment}",
                check.name
            )));
        }
        Ok(CheckOutcome::pass(format!("{} passed", check.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_unavailability_against_seeded_size() {
        let target = InMemoryTarget::new().with_instances("prod", "api:1", 3);
        let old: Vec<String> = target
            .instances("prod")
            .into_iter()
            .take(2)
            .map(|i| i.id)
            .collect();

        target.terminate_instances("prod", &old).await.unwrap();
        assert_eq!(target.max_unavailable_observed("prod"), 2);

        target.launch_instances("prod", "api:2", 2).await.unwrap();
        assert_eq!(target.instances("prod").len(), 3);
        assert_eq!(target.max_unavailable_observed("prod"), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let target = InMemoryTarget::new();
        target.fail_readiness("staging");
        target.mark_artifact_unavailable("api:0");
        target.fail_launches(true);

        assert!(target.check_readiness("staging").await.is_err());
        assert!(target.check_readiness("prod").await.is_ok());
        assert!(!target.artifact_available("api:0").await.unwrap());
        assert!(target.launch_instances("prod", "api:1", 1).await.is_err());
    }
}
