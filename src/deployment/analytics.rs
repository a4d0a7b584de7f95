//! # Deployment Analytics
//!
//! Per-deployment outcome records and grouped summaries: success rates,
//! durations, rollback counts and response-time trends by environment,
//! strategy or component.

use super::types::{DeploymentRecord, ObservedMetrics};
use crate::state_machine::DeploymentStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative change in mean response time that counts as a trend
const TREND_THRESHOLD: f64 = 0.10;
/// Samples needed before a trend is reported
const MIN_TREND_SAMPLES: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub instances_launched: u32,
    pub instances_terminated: u32,
    pub peak_traffic_percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAnalytics {
    pub deployment_id: String,
    pub environment: String,
    pub strategy: String,
    pub components: Vec<String>,
    pub success: bool,
    pub final_status: DeploymentStatus,
    pub duration_ms: u64,
    pub rollback_count: u32,
    pub resource_usage: ResourceUsage,
    pub performance: Option<ObservedMetrics>,
    pub recorded_at: DateTime<Utc>,
}

impl DeploymentAnalytics {
    pub fn from_record(record: &DeploymentRecord, components: &[String]) -> Self {
        Self {
            deployment_id: record.config_id.clone(),
            environment: record.environment.clone(),
            strategy: record.strategy.clone(),
            components: components.to_vec(),
            success: record.status == DeploymentStatus::Completed,
            final_status: record.status,
            duration_ms: record.metrics.duration_ms,
            rollback_count: record.rollback_count,
            resource_usage: ResourceUsage {
                instances_launched: record.metrics.instances_launched,
                instances_terminated: record.metrics.instances_terminated,
                peak_traffic_percentage: record.metrics.traffic_percentage,
            },
            performance: record.metrics.last_observed.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Environment,
    Strategy,
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTrend {
    Improving,
    Degrading,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub group: String,
    pub deployments: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub total_rollbacks: u32,
    pub performance_trend: PerformanceTrend,
}

/// Classify response times (oldest first) by comparing the halves
pub fn performance_trend(response_times: &[f64]) -> PerformanceTrend {
    if response_times.len() < MIN_TREND_SAMPLES {
        return PerformanceTrend::InsufficientData;
    }
    let mid = response_times.len() / 2;
    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    let earlier = mean(&response_times[..mid]);
    let later = mean(&response_times[mid..]);
    if earlier <= 0.0 {
        return PerformanceTrend::Stable;
    }

    let change = (later - earlier) / earlier;
    if change <= -TREND_THRESHOLD {
        PerformanceTrend::Improving
    } else if change >= TREND_THRESHOLD {
        PerformanceTrend::Degrading
    } else {
        PerformanceTrend::Stable
    }
}

#[derive(Debug, Default)]
pub struct AnalyticsManager {
    records: RwLock<Vec<DeploymentAnalytics>>,
}

impl AnalyticsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace the analytics for a deployment
    pub fn record(&self, analytics: DeploymentAnalytics) {
        let mut records = self.records.write();
        match records
            .iter_mut()
            .find(|r| r.deployment_id == analytics.deployment_id)
        {
            Some(existing) => *existing = analytics,
            None => records.push(analytics),
        }
    }

    pub fn get(&self, deployment_id: &str) -> Option<DeploymentAnalytics> {
        self.records
            .read()
            .iter()
            .find(|r| r.deployment_id == deployment_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Summaries keyed by the chosen dimension, sorted by group name
    pub fn summary(&self, group_by: GroupBy) -> Vec<AnalyticsSummary> {
        let records = self.records.read();
        let mut groups: BTreeMap<String, Vec<&DeploymentAnalytics>> = BTreeMap::new();
        for record in records.iter() {
            match group_by {
                GroupBy::Environment => groups
                    .entry(record.environment.clone())
                    .or_default()
                    .push(record),
                GroupBy::Strategy => groups
                    .entry(record.strategy.clone())
                    .or_default()
                    .push(record),
                GroupBy::Component => {
                    for component in &record.components {
                        groups.entry(component.clone()).or_default().push(record);
                    }
                }
            }
        }

        groups
            .into_iter()
            .map(|(group, mut members)| {
                members.sort_by_key(|r| r.recorded_at);
                let deployments = members.len();
                let successes = members.iter().filter(|r| r.success).count();
                let response_times: Vec<f64> = members
                    .iter()
                    .filter_map(|r| r.performance.as_ref()?.response_time_ms)
                    .collect();
                AnalyticsSummary {
                    group,
                    deployments,
                    successes,
                    success_rate: successes as f64 / deployments as f64,
                    average_duration_ms: members.iter().map(|r| r.duration_ms as f64).sum::<f64>()
                        / deployments as f64,
                    total_rollbacks: members.iter().map(|r| r.rollback_count).sum(),
                    performance_trend: performance_trend(&response_times),
                }
            })
            .collect()
    }
}
