//! # Scaling Manager
//!
//! Composes the [`AutoScaler`], [`LoadBalancer`] and [`HealthCheckManager`].
//! Metrics pushed through [`ScalingManager::add_metrics`] feed both the
//! per-component window used for policy evaluation and, when tagged with an
//! instance id, that instance's routing metrics.
//!
//! Scaling actions are applied through a [`ScalingExecutor`]; the tracked
//! instance count only changes after the executor succeeds. Evaluation and
//! manual scaling are serialized so a decision is never made against a stale
//! count.

use super::auto_scaler::{
    AutoScaler, Bottleneck, BottleneckSeverity, CostRecommendation, ScalingDecision,
    ScalingDirection,
};
use super::health_check::{HealthCheckManager, HealthProbe, NetworkHealthProbe};
use super::load_balancer::{LoadBalancer, LoadBalancingStatus};
use super::metrics_window::MetricsWindow;
use super::types::{MetricKind, ScalingMetrics, ScalingPolicy, ServiceInstance};
use crate::config::{OrchestratorConfig, ScalingSettings};
use crate::constants::{events, system::MAX_SCALING_HISTORY};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::events::EventStore;
use crate::logging::{log_error, log_scaling_operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Changes the number of running instances of a component
#[async_trait]
pub trait ScalingExecutor: Send + Sync + std::fmt::Debug {
    async fn scale(&self, component_id: &str, from: u32, to: u32) -> Result<()>;
}

/// Accepts every scaling request without touching infrastructure
#[derive(Debug, Default, Clone)]
pub struct NoopScalingExecutor;

#[async_trait]
impl ScalingExecutor for NoopScalingExecutor {
    async fn scale(&self, component_id: &str, from: u32, to: u32) -> Result<()> {
        debug!(component_id = %component_id, from, to, "No-op scaling executor");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingTrigger {
    Policy { policy_id: String },
    Manual,
}

/// One entry of a component's scaling history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub component_id: String,
    pub trigger: ScalingTrigger,
    pub previous_instances: u32,
    pub target_instances: u32,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of `manual_scale`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingResult {
    pub success: bool,
    pub component_id: String,
    pub previous_instances: u32,
    pub target_instances: u32,
    pub message: String,
    pub category: Option<ErrorCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingState {
    pub current_instances: u32,
    /// Tightest bounds across the component's policies
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub policies: Vec<ScalingPolicy>,
    pub in_cooldown: bool,
    pub history: Vec<ScalingEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub samples: usize,
    pub average: Option<ScalingMetrics>,
    pub bottlenecks: Vec<Bottleneck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStatus {
    pub request_rate: f64,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub active_connections: u64,
    pub queue_length: u64,
}

/// Answer to `get_scaling_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScalingStatus {
    pub component_id: String,
    pub scaling: ScalingState,
    pub load_balancing: LoadBalancingStatus,
    pub resources: ResourceStatus,
    pub performance: PerformanceStatus,
    pub cost: Option<CostRecommendation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component_id: String,
    pub level: HealthLevel,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub bottlenecks: Vec<Bottleneck>,
}

/// Answer to `get_system_health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthLevel,
    pub components: Vec<ComponentHealth>,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub critical_bottlenecks: usize,
    /// Dependencies whose circuit breaker is open
    #[serde(default)]
    pub open_circuits: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    /// Fold open breakers in; any open breaker is at least a warning
    pub fn with_open_circuits(mut self, mut open_circuits: Vec<String>) -> Self {
        open_circuits.sort();
        if !open_circuits.is_empty() {
            self.overall = self.overall.max(HealthLevel::Warning);
        }
        self.open_circuits = open_circuits;
        self
    }
}

#[derive(Debug)]
pub struct ScalingManager {
    scaler: AutoScaler,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthCheckManager>,
    executor: Arc<dyn ScalingExecutor>,
    settings: ScalingSettings,
    windows: DashMap<String, MetricsWindow>,
    instance_counts: DashMap<String, u32>,
    history: DashMap<String, VecDeque<ScalingEvent>>,
    /// Last bottleneck set reported per component
    reported_bottlenecks: DashMap<String, Vec<(MetricKind, BottleneckSeverity)>>,
    apply_lock: Mutex<()>,
    events: EventStore,
    shutdown: watch::Sender<bool>,
}

impl ScalingManager {
    /// Build with network probes and the no-op executor
    pub fn new(config: &OrchestratorConfig, events: EventStore) -> Result<Self> {
        let probe = NetworkHealthProbe::new(config.health_checks.timeout())?;
        Self::with_collaborators(
            config,
            events,
            Arc::new(probe),
            Arc::new(NoopScalingExecutor),
        )
    }

    pub fn with_collaborators(
        config: &OrchestratorConfig,
        events: EventStore,
        probe: Arc<dyn HealthProbe>,
        executor: Arc<dyn ScalingExecutor>,
    ) -> Result<Self> {
        let scaler = AutoScaler::new(
            config.scaling.policies.clone(),
            config.scaling.bottleneck.clone(),
            config.scaling.cost.clone(),
        )?;
        let balancer = Arc::new(LoadBalancer::new(
            config.load_balancer.clone(),
            events.clone(),
        ));
        let health = Arc::new(HealthCheckManager::new(
            Arc::clone(&balancer),
            probe,
            config.health_checks.clone(),
            events.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            scaler,
            balancer,
            health,
            executor,
            settings: config.scaling.clone(),
            windows: DashMap::new(),
            instance_counts: DashMap::new(),
            history: DashMap::new(),
            reported_bottlenecks: DashMap::new(),
            apply_lock: Mutex::new(()),
            events,
            shutdown,
        })
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn health_checks(&self) -> &Arc<HealthCheckManager> {
        &self.health
    }

    pub fn auto_scaler(&self) -> &AutoScaler {
        &self.scaler
    }

    // ===== Metrics =====

    /// Record a metrics sample for a component
    pub fn add_metrics(&self, component_id: &str, metrics: ScalingMetrics) -> Result<()> {
        if component_id.trim().is_empty() {
            return Err(OrchestratorError::validation("component_id must not be empty"));
        }
        let invalid = [
            metrics.cpu,
            metrics.memory,
            metrics.request_rate,
            metrics.response_time_ms,
            metrics.error_rate,
        ]
        .into_iter()
        .any(|v| !v.is_finite() || v < 0.0);
        if invalid {
            return Err(OrchestratorError::validation(format!(
                "metrics for {component_id} must be finite and non-negative"
            )));
        }

        // A sample for an unknown instance must not reach the window
        if let Some(instance_id) = metrics.instance_id.as_deref() {
            self.balancer
                .update_instance_metrics(component_id, instance_id, metrics.clone())
                .map_err(|_| {
                    OrchestratorError::not_found("instance", format!("{component_id}/{instance_id}"))
                })?;
        }

        self.windows
            .entry(component_id.to_string())
            .or_insert_with(|| {
                MetricsWindow::new(
                    self.settings.metrics_window(),
                    self.settings.max_samples_per_component,
                )
            })
            .push(metrics);
        Ok(())
    }

    /// Tracked instance count; falls back to the number of registered instances
    pub fn instance_count(&self, component_id: &str) -> u32 {
        self.instance_counts
            .get(component_id)
            .map(|count| *count)
            .unwrap_or_else(|| self.balancer.instances(component_id).len() as u32)
    }

    pub fn history(&self, component_id: &str) -> Vec<ScalingEvent> {
        self.history
            .get(component_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ===== Policies =====

    pub fn upsert_policy(&self, policy: ScalingPolicy) -> Result<()> {
        let payload = json!({ "action": "upsert", "policy": policy });
        let policy_id = policy.id.clone();
        self.scaler.upsert_policy(policy)?;
        info!(policy_id = %policy_id, "🎛️ Scaling policy updated");
        self.events
            .append(events::SCALING_POLICY_UPDATED, Some(&policy_id), payload);
        Ok(())
    }

    pub fn remove_policy(&self, policy_id: &str) -> Option<ScalingPolicy> {
        let removed = self.scaler.remove_policy(policy_id)?;
        info!(policy_id = %policy_id, "🎛️ Scaling policy removed");
        self.events.append(
            events::SCALING_POLICY_UPDATED,
            Some(policy_id),
            json!({ "action": "remove", "component_id": removed.component_id }),
        );
        Some(removed)
    }

    /// Replace every policy at once; an invalid set leaves the old one active
    pub fn reload_policies(&self, policies: Vec<ScalingPolicy>) -> Result<()> {
        let count = policies.len();
        self.scaler.reload(policies)?;
        info!(policies = count, "🎛️ Scaling policies reloaded");
        self.events.append(
            events::SCALING_POLICY_UPDATED,
            None,
            json!({ "action": "reload", "policies": count }),
        );
        Ok(())
    }

    // ===== Instances and routing =====

    pub fn register_instance(&self, component_id: &str, instance: ServiceInstance) -> Result<()> {
        self.balancer.register_instance(component_id, instance)
    }

    pub fn unregister_instance(&self, component_id: &str, instance_id: &str) -> Result<ServiceInstance> {
        let removed = self.balancer.unregister_instance(component_id, instance_id)?;
        self.health.forget(component_id, instance_id);
        Ok(removed)
    }

    pub fn route(&self, component_id: &str, client_key: Option<&str>) -> Option<ServiceInstance> {
        self.balancer.select_instance(component_id, client_key)
    }

    // ===== Scaling =====

    /// One evaluation tick over every component with a policy
    pub async fn evaluate(&self) -> Vec<ScalingEvent> {
        let _guard = self.apply_lock.lock().await;
        let components: BTreeSet<String> = self
            .scaler
            .policies()
            .into_iter()
            .map(|p| p.component_id)
            .collect();

        let mut applied = Vec::new();
        for component_id in &components {
            let current = self.instance_count(component_id);
            let Some(decision) = self.decide(component_id, current) else {
                continue;
            };
            let trigger = ScalingTrigger::Policy {
                policy_id: decision.policy_id.clone(),
            };
            match self
                .apply(component_id, current, decision.target_instances, trigger, &decision.reason)
                .await
            {
                Ok(event) | Err((event, _)) => applied.push(event),
            }
        }

        let observed: BTreeSet<String> = self.windows.iter().map(|w| w.key().clone()).collect();
        for component_id in observed {
            self.report_bottlenecks(&component_id);
        }
        applied
    }

    /// Combine every enabled policy's decision; growth wins over shrinking
    fn decide(&self, component_id: &str, current: u32) -> Option<ScalingDecision> {
        let decisions: Vec<ScalingDecision> = self
            .scaler
            .policies_for(component_id)
            .iter()
            .filter_map(|policy| {
                let aggregate = self
                    .windows
                    .get_mut(component_id)
                    .and_then(|mut window| window.aggregate(policy.target_metric));
                self.scaler.evaluate(policy, aggregate, current)
            })
            .collect();

        let up = decisions
            .iter()
            .filter(|d| d.direction == ScalingDirection::Up)
            .max_by_key(|d| d.target_instances)
            .cloned();
        let chosen = match up {
            Some(decision) => decision,
            None => decisions
                .into_iter()
                .max_by_key(|d| d.target_instances)?,
        };

        let target = match self.scaler.bounds_for(component_id) {
            Some((min, max)) if min <= max => chosen.target_instances.clamp(min, max),
            _ => chosen.target_instances,
        };
        (target != current).then(|| ScalingDecision {
            target_instances: target,
            ..chosen
        })
    }

    async fn apply(
        &self,
        component_id: &str,
        previous: u32,
        target: u32,
        trigger: ScalingTrigger,
        reason: &str,
    ) -> std::result::Result<ScalingEvent, (ScalingEvent, OrchestratorError)> {
        let outcome = self.executor.scale(component_id, previous, target).await;
        let event = ScalingEvent {
            component_id: component_id.to_string(),
            trigger: trigger.clone(),
            previous_instances: previous,
            target_instances: target,
            reason: reason.to_string(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            timestamp: Utc::now(),
        };
        self.push_history(event.clone());

        match outcome {
            Ok(()) => {
                self.instance_counts.insert(component_id.to_string(), target);
                self.scaler.record_action(component_id);

                let event_type = match (&trigger, target > previous) {
                    (ScalingTrigger::Manual, _) => events::SCALING_MANUAL,
                    (_, true) => events::SCALING_SCALED_UP,
                    (_, false) => events::SCALING_SCALED_DOWN,
                };
                log_scaling_operation(event_type, component_id, previous, target, reason);
                self.events.append(
                    event_type,
                    Some(component_id),
                    json!({
                        "trigger": trigger,
                        "previous_instances": previous,
                        "target_instances": target,
                        "reason": reason,
                    }),
                );
                Ok(event)
            }
            Err(error) => {
                log_error(
                    "ScalingManager",
                    "apply",
                    &error.to_string(),
                    Some(component_id),
                );
                self.events.append(
                    events::SCALING_FAILED,
                    Some(component_id),
                    json!({
                        "trigger": trigger,
                        "previous_instances": previous,
                        "target_instances": target,
                        "category": error.category(),
                        "error": error.to_string(),
                    }),
                );
                Err((event, error))
            }
        }
    }

    fn push_history(&self, event: ScalingEvent) {
        let mut history = self
            .history
            .entry(event.component_id.clone())
            .or_default();
        history.push_back(event);
        while history.len() > MAX_SCALING_HISTORY {
            history.pop_front();
        }
    }

    fn report_bottlenecks(&self, component_id: &str) {
        let Some(average) = self
            .windows
            .get_mut(component_id)
            .and_then(|mut window| window.average())
        else {
            return;
        };
        let bottlenecks = self.scaler.detect_bottlenecks(&average);
        let signature: Vec<(MetricKind, BottleneckSeverity)> =
            bottlenecks.iter().map(|b| (b.resource, b.severity)).collect();

        let changed = self
            .reported_bottlenecks
            .insert(component_id.to_string(), signature.clone())
            .map_or(!signature.is_empty(), |previous| previous != signature);
        if !changed || bottlenecks.is_empty() {
            return;
        }

        for bottleneck in &bottlenecks {
            warn!(
                component_id = %component_id,
                resource = %bottleneck.resource,
                severity = ?bottleneck.severity,
                value = bottleneck.value,
                threshold = bottleneck.threshold,
                "🔥 Bottleneck detected"
            );
        }
        self.events.append(
            events::SCALING_BOTTLENECK_DETECTED,
            Some(component_id),
            json!({ "bottlenecks": bottlenecks }),
        );
    }

    /// Set a component's instance count directly, within policy bounds
    pub async fn manual_scale(&self, component_id: &str, target: u32, reason: &str) -> ScalingResult {
        let _guard = self.apply_lock.lock().await;
        let previous = self.instance_count(component_id);
        let result = |success, message: String, category| ScalingResult {
            success,
            component_id: component_id.to_string(),
            previous_instances: previous,
            target_instances: target,
            message,
            category,
        };

        if let Some((min, max)) = self.scaler.bounds_for(component_id) {
            if !(min..=max).contains(&target) {
                let error = OrchestratorError::validation(format!(
                    "target {target} is outside policy bounds {min}..={max} for {component_id}"
                ));
                warn!(component_id = %component_id, target, min, max, "Manual scale rejected");
                self.events.append(
                    events::SCALING_FAILED,
                    Some(component_id),
                    json!({
                        "trigger": ScalingTrigger::Manual,
                        "target_instances": target,
                        "category": error.category(),
                        "error": error.to_string(),
                    }),
                );
                return result(false, error.to_string(), Some(error.category()));
            }
        }
        if target == previous {
            return result(true, format!("{component_id} already has {target} instance(s)"), None);
        }

        match self
            .apply(component_id, previous, target, ScalingTrigger::Manual, reason)
            .await
        {
            Ok(_) => result(
                true,
                format!("{component_id} scaled from {previous} to {target}"),
                None,
            ),
            Err((_, error)) => result(false, error.to_string(), Some(error.category())),
        }
    }

    // ===== Status =====

    fn is_known(&self, component_id: &str) -> bool {
        self.windows.contains_key(component_id)
            || self.instance_counts.contains_key(component_id)
            || !self.scaler.policies_for(component_id).is_empty()
            || self.balancer.components().iter().any(|c| c == component_id)
    }

    pub fn get_scaling_status(&self, component_id: &str) -> Result<ComponentScalingStatus> {
        if !self.is_known(component_id) {
            return Err(OrchestratorError::not_found("component", component_id));
        }

        let (samples, average) = self
            .windows
            .get_mut(component_id)
            .map(|mut window| (window.len(), window.average()))
            .unwrap_or((0, None));
        let bottlenecks = average
            .as_ref()
            .map(|avg| self.scaler.detect_bottlenecks(avg))
            .unwrap_or_default();

        let policies = self.scaler.policies_for(component_id);
        let bounds = self.scaler.bounds_for(component_id);
        let current = self.instance_count(component_id);
        let cooldown = policies
            .iter()
            .map(ScalingPolicy::cooldown_period)
            .max()
            .unwrap_or_default();
        let cost = average.as_ref().and_then(|avg| {
            self.scaler.cost_recommendation(
                component_id,
                avg,
                samples,
                current,
                bounds.map_or(1, |(min, _)| min),
            )
        });
        let performance = average
            .as_ref()
            .map(|avg| PerformanceStatus {
                request_rate: avg.request_rate,
                response_time_ms: avg.response_time_ms,
                error_rate: avg.error_rate,
                active_connections: avg.active_connections,
                queue_length: avg.queue_length,
            })
            .unwrap_or_default();

        Ok(ComponentScalingStatus {
            component_id: component_id.to_string(),
            scaling: ScalingState {
                current_instances: current,
                min_instances: bounds.map(|(min, _)| min),
                max_instances: bounds.map(|(_, max)| max),
                in_cooldown: self.scaler.in_cooldown(component_id, cooldown),
                policies,
                history: self.history(component_id),
            },
            load_balancing: self.balancer.status(component_id),
            resources: ResourceStatus {
                samples,
                average,
                bottlenecks,
            },
            performance,
            cost,
        })
    }

    /// Roll instance health and bottlenecks up into one level
    pub fn get_system_health(&self) -> SystemHealth {
        let mut components: BTreeSet<String> = self.balancer.components().into_iter().collect();
        components.extend(self.windows.iter().map(|w| w.key().clone()));

        let components: Vec<ComponentHealth> = components
            .into_iter()
            .map(|component_id| {
                let instances = self.balancer.instances(&component_id);
                let total = instances.len();
                let healthy = instances.iter().filter(|i| i.healthy).count();
                let bottlenecks = self
                    .windows
                    .get_mut(&component_id)
                    .and_then(|mut window| window.average())
                    .map(|avg| self.scaler.detect_bottlenecks(&avg))
                    .unwrap_or_default();

                let worst = bottlenecks.iter().map(|b| b.severity).max();
                let level = if (total > 0 && healthy == 0)
                    || worst == Some(BottleneckSeverity::Critical)
                {
                    HealthLevel::Critical
                } else if healthy < total || worst == Some(BottleneckSeverity::Warning) {
                    HealthLevel::Warning
                } else {
                    HealthLevel::Healthy
                };

                ComponentHealth {
                    component_id,
                    level,
                    total_instances: total,
                    healthy_instances: healthy,
                    bottlenecks,
                }
            })
            .collect();

        SystemHealth {
            overall: components
                .iter()
                .map(|c| c.level)
                .max()
                .unwrap_or(HealthLevel::Healthy),
            total_instances: components.iter().map(|c| c.total_instances).sum(),
            healthy_instances: components.iter().map(|c| c.healthy_instances).sum(),
            critical_bottlenecks: components
                .iter()
                .flat_map(|c| &c.bottlenecks)
                .filter(|b| b.severity == BottleneckSeverity::Critical)
                .count(),
            components,
            open_circuits: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    // ===== Lifecycle =====

    /// Start the evaluation and health check loops
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let evaluation = tokio::spawn(async move {
            info!(
                interval_ms = this.settings.evaluation_interval_ms,
                "📈 Scaling evaluation loop started"
            );
            let mut ticker = interval(this.settings.evaluation_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let applied = this.evaluate().await;
                        if !applied.is_empty() {
                            debug!(actions = applied.len(), "Scaling tick applied actions");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scaling evaluation loop shutting down");
        });

        vec![evaluation, self.health.start(self.shutdown.subscribe())]
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::types::ProbeMethod;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingExecutor {
        calls: SyncMutex<Vec<(String, u32, u32)>>,
        fail: SyncMutex<bool>,
    }

    #[async_trait]
    impl ScalingExecutor for RecordingExecutor {
        async fn scale(&self, component_id: &str, from: u32, to: u32) -> Result<()> {
            if *self.fail.lock() {
                return Err(OrchestratorError::transient("cluster-api", "quota exceeded"));
            }
            self.calls.lock().push((component_id.to_string(), from, to));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _: &ServiceInstance, _: ProbeMethod) -> Result<()> {
            Ok(())
        }
    }

    fn manager(policies: Vec<ScalingPolicy>) -> (ScalingManager, Arc<RecordingExecutor>, EventStore) {
        let mut config = OrchestratorConfig::default();
        config.scaling.policies = policies;
        let store = EventStore::default();
        let executor = Arc::new(RecordingExecutor::default());
        let manager = ScalingManager::with_collaborators(
            &config,
            store.clone(),
            Arc::new(AlwaysHealthy),
            Arc::clone(&executor) as Arc<dyn ScalingExecutor>,
        )
        .unwrap();
        (manager, executor, store)
    }

    fn cpu_policy(cooldown: Duration) -> ScalingPolicy {
        ScalingPolicy::new("api-cpu", "api", MetricKind::Cpu, 70.0, 30.0)
            .with_bounds(2, 10)
            .with_steps(2, 1)
            .with_cooldown(cooldown)
    }

    #[tokio::test]
    async fn test_scale_up_is_clamped_to_max() {
        let (manager, _, store) = manager(vec![cpu_policy(Duration::ZERO)]);
        assert!(manager.manual_scale("api", 4, "baseline").await.success);
        manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(85.0))
            .unwrap();

        let mut counts = Vec::new();
        for _ in 0..4 {
            manager.evaluate().await;
            counts.push(manager.instance_count("api"));
        }
        assert_eq!(counts, vec![6, 8, 10, 10]);
        assert_eq!(
            store
                .query(&crate::events::EventFilter::all().with_type(events::SCALING_SCALED_UP))
                .len(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_consecutive_actions() {
        let (manager, executor, _) = manager(vec![cpu_policy(Duration::from_secs(60))]);
        manager.instance_counts.insert("api".to_string(), 4);
        manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(85.0))
            .unwrap();

        manager.evaluate().await;
        manager.evaluate().await;
        assert_eq!(manager.instance_count("api"), 6);

        tokio::time::advance(Duration::from_secs(61)).await;
        manager.evaluate().await;
        assert_eq!(manager.instance_count("api"), 8);
        assert_eq!(executor.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_and_bounds_correction() {
        let (manager, _, _) = manager(vec![cpu_policy(Duration::ZERO)]);
        // Nothing registered yet: the count starts below the minimum
        manager.evaluate().await;
        assert_eq!(manager.instance_count("api"), 2);

        manager.instance_counts.insert("api".to_string(), 4);
        manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(10.0))
            .unwrap();
        manager.evaluate().await;
        manager.evaluate().await;
        manager.evaluate().await;
        assert_eq!(manager.instance_count("api"), 2);
    }

    #[tokio::test]
    async fn test_disabled_policy_never_acts() {
        let (manager, executor, _) = manager(vec![cpu_policy(Duration::ZERO).disabled()]);
        manager.instance_counts.insert("api".to_string(), 1);
        manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(99.0))
            .unwrap();
        assert!(manager.evaluate().await.is_empty());
        assert!(executor.calls.lock().is_empty());
        assert_eq!(manager.instance_count("api"), 1);
    }

    #[tokio::test]
    async fn test_manual_scale_rejects_out_of_bounds_and_executor_failure() {
        let (manager, executor, store) = manager(vec![cpu_policy(Duration::ZERO)]);
        manager.instance_counts.insert("api".to_string(), 3);

        let rejected = manager.manual_scale("api", 11, "too many").await;
        assert!(!rejected.success);
        assert_eq!(rejected.category, Some(ErrorCategory::Validation));

        *executor.fail.lock() = true;
        let failed = manager.manual_scale("api", 5, "burst").await;
        assert!(!failed.success);
        assert_eq!(failed.category, Some(ErrorCategory::TransientDependency));
        assert_eq!(manager.instance_count("api"), 3);
        assert_eq!(store.events_for_entity("api").len(), 2);
        assert!(!manager.history("api")[0].success);
    }

    #[tokio::test]
    async fn test_bottleneck_event_only_on_change() {
        let (manager, _, store) = manager(Vec::new());
        manager
            .add_metrics("worker", ScalingMetrics::default().with_cpu(95.0))
            .unwrap();
        manager.evaluate().await;
        manager.evaluate().await;

        let filter = crate::events::EventFilter::all().with_type(events::SCALING_BOTTLENECK_DETECTED);
        assert_eq!(store.query(&filter).len(), 1);

        let health = manager.get_system_health();
        assert_eq!(health.overall, HealthLevel::Critical);
        assert_eq!(health.critical_bottlenecks, 1);
    }

    #[tokio::test]
    async fn test_status_and_instance_metrics_relay() {
        let (manager, _, _) = manager(vec![cpu_policy(Duration::ZERO)]);
        manager
            .register_instance("api", ServiceInstance::new("api-1", "10.0.0.5", 9000))
            .unwrap();
        manager
            .add_metrics(
                "api",
                ScalingMetrics::default()
                    .with_cpu(40.0)
                    .with_active_connections(12)
                    .for_instance("api-1"),
            )
            .unwrap();

        let status = manager.get_scaling_status("api").unwrap();
        assert_eq!(status.scaling.current_instances, 1);
        assert_eq!(status.scaling.min_instances, Some(2));
        assert_eq!(status.resources.samples, 1);
        assert_eq!(status.performance.active_connections, 12);
        assert_eq!(status.load_balancing.total_instances, 1);
        assert_eq!(manager.load_balancer().instances("api")[0].active_connections(), 12);

        assert!(manager.get_scaling_status("unknown").is_err());
        assert!(manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(f64::NAN))
            .is_err());
        assert_eq!(manager.get_system_health().overall, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn test_sample_for_unknown_instance_is_rejected_whole() {
        let (manager, executor, _) = manager(vec![cpu_policy(Duration::ZERO)]);
        assert!(manager.manual_scale("api", 4, "baseline").await.success);

        let err = manager
            .add_metrics("api", ScalingMetrics::default().with_cpu(95.0).for_instance("ghost"))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotFound { ref entity, .. } if entity == "instance"
        ));

        assert_eq!(manager.get_scaling_status("api").unwrap().resources.samples, 0);
        assert!(manager.evaluate().await.is_empty());
        assert_eq!(manager.instance_count("api"), 4);
        assert_eq!(executor.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reregistered_instance_starts_with_fresh_counters() {
        let (manager, _, _) = manager(Vec::new());
        manager
            .register_instance("api", ServiceInstance::new("api-1", "10.0.0.5", 9000))
            .unwrap();
        let health = manager.health_checks();
        for _ in 0..2 {
            health.record_result("api", "api-1", Err("connection refused".to_string()));
        }
        assert_eq!(health.probe_record("api", "api-1").unwrap().consecutive_failures, 2);

        manager.unregister_instance("api", "api-1").unwrap();
        assert!(health.probe_record("api", "api-1").is_none());

        manager
            .register_instance("api", ServiceInstance::new("api-1", "10.0.0.6", 9000))
            .unwrap();
        assert!(health
            .record_result("api", "api-1", Err("connection refused".to_string()))
            .is_none());
        assert_eq!(health.probe_record("api", "api-1").unwrap().consecutive_failures, 1);
        assert_eq!(manager.load_balancer().healthy_instances("api").len(), 1);
    }
}
