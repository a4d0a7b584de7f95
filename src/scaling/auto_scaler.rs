//! # Auto-Scaling Engine
//!
//! Policy evaluation, bottleneck detection and cost optimization for
//! components. The engine only recommends; [`super::ScalingManager`] applies
//! decisions and records when a component last scaled, which drives cooldown.

use super::types::{MetricKind, ScalingMetrics, ScalingPolicy};
use crate::config::{BottleneckThresholds, CostModelConfig};
use crate::constants::system::HOURS_PER_MONTH;
use crate::error::{OrchestratorError, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDirection {
    Up,
    Down,
}

/// A recommended change in instance count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub policy_id: String,
    pub component_id: String,
    pub direction: ScalingDirection,
    pub previous_instances: u32,
    pub target_instances: u32,
    pub metric: MetricKind,
    /// Window aggregate that triggered the decision, if any
    pub observed: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub resource: MetricKind,
    pub severity: BottleneckSeverity,
    pub value: f64,
    pub threshold: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecommendation {
    pub component_id: String,
    pub current_instances: u32,
    pub recommended_instances: u32,
    /// Higher of mean cpu and mean memory, in percent
    pub average_utilization: f64,
    /// Never negative
    pub estimated_monthly_savings: f64,
}

#[derive(Debug)]
pub struct AutoScaler {
    policies: RwLock<BTreeMap<String, ScalingPolicy>>,
    last_action: DashMap<String, Instant>,
    bottleneck: BottleneckThresholds,
    cost: CostModelConfig,
}

impl AutoScaler {
    pub fn new(
        policies: Vec<ScalingPolicy>,
        bottleneck: BottleneckThresholds,
        cost: CostModelConfig,
    ) -> Result<Self> {
        let scaler = Self {
            policies: RwLock::new(BTreeMap::new()),
            last_action: DashMap::new(),
            bottleneck,
            cost,
        };
        scaler.reload(policies)?;
        info!(
            policies = scaler.policies.read().len(),
            "🎛️ Auto-scaler initialized"
        );
        Ok(scaler)
    }

    /// Insert or replace one policy
    pub fn upsert_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy
            .validate()
            .map_err(|e| OrchestratorError::validation(format!("policy {}: {e}", policy.id)))?;
        debug!(policy_id = %policy.id, component_id = %policy.component_id, "Scaling policy installed");
        self.policies.write().insert(policy.id.clone(), policy);
        Ok(())
    }

    pub fn remove_policy(&self, policy_id: &str) -> Option<ScalingPolicy> {
        self.policies.write().remove(policy_id)
    }

    /// Replace the whole policy set; nothing changes if any policy is invalid
    pub fn reload(&self, policies: Vec<ScalingPolicy>) -> Result<()> {
        let mut next = BTreeMap::new();
        for policy in policies {
            policy
                .validate()
                .map_err(|e| OrchestratorError::validation(format!("policy {}: {e}", policy.id)))?;
            next.insert(policy.id.clone(), policy);
        }
        *self.policies.write() = next;
        Ok(())
    }

    /// All policies, ordered by id
    pub fn policies(&self) -> Vec<ScalingPolicy> {
        self.policies.read().values().cloned().collect()
    }

    pub fn policies_for(&self, component_id: &str) -> Vec<ScalingPolicy> {
        self.policies
            .read()
            .values()
            .filter(|p| p.component_id == component_id)
            .cloned()
            .collect()
    }

    /// Tightest instance bounds across the component's policies
    pub fn bounds_for(&self, component_id: &str) -> Option<(u32, u32)> {
        self.policies
            .read()
            .values()
            .filter(|p| p.component_id == component_id)
            .fold(None, |bounds, p| match bounds {
                None => Some((p.min_instances, p.max_instances)),
                Some((min, max)) => Some((min.max(p.min_instances), max.min(p.max_instances))),
            })
    }

    pub fn record_action(&self, component_id: &str) {
        self.last_action
            .insert(component_id.to_string(), Instant::now());
    }

    pub fn last_action_elapsed(&self, component_id: &str) -> Option<Duration> {
        self.last_action.get(component_id).map(|at| at.elapsed())
    }

    pub fn in_cooldown(&self, component_id: &str, cooldown: Duration) -> bool {
        self.last_action_elapsed(component_id)
            .is_some_and(|elapsed| elapsed < cooldown)
    }

    /// Decide whether `policy` should change the instance count
    ///
    /// `aggregate` is the target metric's mean over the window. Counts outside
    /// the policy bounds are corrected regardless of metrics or cooldown.
    pub fn evaluate(
        &self,
        policy: &ScalingPolicy,
        aggregate: Option<f64>,
        current: u32,
    ) -> Option<ScalingDecision> {
        if !policy.enabled {
            return None;
        }

        let decision = |direction, target: u32, reason: String| ScalingDecision {
            policy_id: policy.id.clone(),
            component_id: policy.component_id.clone(),
            direction,
            previous_instances: current,
            target_instances: target,
            metric: policy.target_metric,
            observed: aggregate,
            reason,
        };

        if current < policy.min_instances {
            return Some(decision(
                ScalingDirection::Up,
                policy.min_instances,
                format!("{current} instance(s) below minimum {}", policy.min_instances),
            ));
        }
        if current > policy.max_instances {
            return Some(decision(
                ScalingDirection::Down,
                policy.max_instances,
                format!("{current} instance(s) above maximum {}", policy.max_instances),
            ));
        }

        let value = aggregate?;
        if self.in_cooldown(&policy.component_id, policy.cooldown_period()) {
            debug!(
                component_id = %policy.component_id,
                policy_id = %policy.id,
                "Scaling skipped during cooldown"
            );
            return None;
        }

        if value > policy.scale_up_threshold && current < policy.max_instances {
            let target = current
                .saturating_add(policy.scale_up_step)
                .min(policy.max_instances);
            return Some(decision(
                ScalingDirection::Up,
                target,
                format!(
                    "{} {value:.2} above {}",
                    policy.target_metric, policy.scale_up_threshold
                ),
            ));
        }
        if value < policy.scale_down_threshold && current > policy.min_instances {
            let target = current
                .saturating_sub(policy.scale_down_step)
                .max(policy.min_instances);
            return Some(decision(
                ScalingDirection::Down,
                target,
                format!(
                    "{} {value:.2} below {}",
                    policy.target_metric, policy.scale_down_threshold
                ),
            ));
        }
        None
    }

    /// Resources whose window average crosses a severity threshold
    pub fn detect_bottlenecks(&self, average: &ScalingMetrics) -> Vec<Bottleneck> {
        let t = &self.bottleneck;
        let checks = [
            (MetricKind::Cpu, average.cpu, t.cpu_warning, t.cpu_critical),
            (MetricKind::Memory, average.memory, t.memory_warning, t.memory_critical),
            (
                MetricKind::ResponseTime,
                average.response_time_ms,
                t.response_time_warning_ms,
                t.response_time_critical_ms,
            ),
            (
                MetricKind::ErrorRate,
                average.error_rate,
                t.error_rate_warning,
                t.error_rate_critical,
            ),
            (
                MetricKind::QueueLength,
                average.queue_length as f64,
                t.queue_length_warning,
                t.queue_length_critical,
            ),
        ];

        checks
            .into_iter()
            .filter_map(|(resource, value, warning, critical)| {
                let (severity, threshold) = if value >= critical {
                    (BottleneckSeverity::Critical, critical)
                } else if value >= warning {
                    (BottleneckSeverity::Warning, warning)
                } else {
                    return None;
                };
                Some(Bottleneck {
                    resource,
                    severity,
                    value,
                    threshold,
                    recommendations: recommendations(resource, severity),
                })
            })
            .collect()
    }

    /// Propose downsizing when sustained utilization is low
    ///
    /// Recommended count is `ceil(current * utilization / target)`, kept at or
    /// above `min_instances`; savings are the removed instances at the hourly
    /// rate over a month.
    pub fn cost_recommendation(
        &self,
        component_id: &str,
        average: &ScalingMetrics,
        samples: usize,
        current: u32,
        min_instances: u32,
    ) -> Option<CostRecommendation> {
        if samples < self.cost.min_samples || current <= min_instances {
            return None;
        }
        let utilization = average.cpu.max(average.memory);
        if utilization >= self.cost.low_utilization_threshold || self.cost.target_utilization <= 0.0
        {
            return None;
        }

        let needed = (f64::from(current) * utilization / self.cost.target_utilization).ceil() as u32;
        let recommended = needed.max(min_instances).max(1).min(current);
        if recommended >= current {
            return None;
        }
        let savings = f64::from(current - recommended) * self.cost.instance_hourly_cost * HOURS_PER_MONTH;

        Some(CostRecommendation {
            component_id: component_id.to_string(),
            current_instances: current,
            recommended_instances: recommended,
            average_utilization: utilization,
            estimated_monthly_savings: savings.max(0.0),
        })
    }
}

fn recommendations(resource: MetricKind, severity: BottleneckSeverity) -> Vec<String> {
    let urgent = severity == BottleneckSeverity::Critical;
    let mut advice = match resource {
        MetricKind::Cpu => vec![
            "add instances or raise the cpu allocation".to_string(),
            "profile hot code paths".to_string(),
        ],
        MetricKind::Memory => vec![
            "raise the memory limit".to_string(),
            "check for leaks and oversized caches".to_string(),
        ],
        MetricKind::ResponseTime => vec![
            "add instances to spread load".to_string(),
            "review slow downstream calls and queries".to_string(),
        ],
        MetricKind::ErrorRate => vec![
            "inspect recent deployments for regressions".to_string(),
            "check downstream dependency health".to_string(),
        ],
        MetricKind::QueueLength => vec![
            "add consumers to drain the backlog".to_string(),
        ],
        MetricKind::RequestRate | MetricKind::ActiveConnections => vec![
            "review load balancing weights".to_string(),
        ],
    };
    if urgent {
        advice.insert(0, format!("{resource} is critical; act immediately"));
    }
    advice
}
