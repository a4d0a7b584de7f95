//! Shared scaling and routing types: policies, metric samples, instances and
//! the routing and probing methods they are configured with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A metric a scaling policy can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    RequestRate,
    ResponseTime,
    ErrorRate,
    ActiveConnections,
    QueueLength,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        Self::Cpu,
        Self::Memory,
        Self::RequestRate,
        Self::ResponseTime,
        Self::ErrorRate,
        Self::ActiveConnections,
        Self::QueueLength,
    ];

    pub fn value_of(&self, metrics: &ScalingMetrics) -> f64 {
        match self {
            Self::Cpu => metrics.cpu,
            Self::Memory => metrics.memory,
            Self::RequestRate => metrics.request_rate,
            Self::ResponseTime => metrics.response_time_ms,
            Self::ErrorRate => metrics.error_rate,
            Self::ActiveConnections => metrics.active_connections as f64,
            Self::QueueLength => metrics.queue_length as f64,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::RequestRate => "request_rate",
            Self::ResponseTime => "response_time",
            Self::ErrorRate => "error_rate",
            Self::ActiveConnections => "active_connections",
            Self::QueueLength => "queue_length",
        };
        f.write_str(name)
    }
}

/// One runtime sample for a component (or, with `instance_id`, one instance)
///
/// `cpu` and `memory` are percentages (0-100), `error_rate` a fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub request_rate: f64,
    #[serde(default)]
    pub response_time_ms: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub queue_length: u64,
    /// Instance the sample came from; also updates its routing metrics
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Default for ScalingMetrics {
    fn default() -> Self {
        Self {
            cpu: 0.0,
            memory: 0.0,
            request_rate: 0.0,
            response_time_ms: 0.0,
            error_rate: 0.0,
            active_connections: 0,
            queue_length: 0,
            instance_id: None,
            timestamp: Utc::now(),
        }
    }
}

impl ScalingMetrics {
    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_memory(mut self, memory: f64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_request_rate(mut self, request_rate: f64) -> Self {
        self.request_rate = request_rate;
        self
    }

    pub fn with_response_time(mut self, response_time_ms: f64) -> Self {
        self.response_time_ms = response_time_ms;
        self
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate;
        self
    }

    pub fn with_active_connections(mut self, active_connections: u64) -> Self {
        self.active_connections = active_connections;
        self
    }

    pub fn with_queue_length(mut self, queue_length: u64) -> Self {
        self.queue_length = queue_length;
        self
    }

    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_step() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Threshold-driven scaling rule for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub id: String,
    pub component_id: String,
    pub target_metric: MetricKind,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_instances: u32,
    pub max_instances: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_period_seconds: u64,
    #[serde(default = "default_step")]
    pub scale_up_step: u32,
    #[serde(default = "default_step")]
    pub scale_down_step: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScalingPolicy {
    pub fn new(
        id: impl Into<String>,
        component_id: impl Into<String>,
        target_metric: MetricKind,
        scale_up_threshold: f64,
        scale_down_threshold: f64,
    ) -> Self {
        Self {
            id: id.into(),
            component_id: component_id.into(),
            target_metric,
            scale_up_threshold,
            scale_down_threshold,
            min_instances: 1,
            max_instances: 10,
            cooldown_period_seconds: default_cooldown_seconds(),
            scale_up_step: 1,
            scale_down_step: 1,
            enabled: true,
        }
    }

    pub fn with_bounds(mut self, min_instances: u32, max_instances: u32) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    pub fn with_steps(mut self, scale_up_step: u32, scale_down_step: u32) -> Self {
        self.scale_up_step = scale_up_step;
        self.scale_down_step = scale_down_step;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_period_seconds = cooldown.as_secs();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_seconds)
    }

    pub fn clamp(&self, instances: u32) -> u32 {
        instances.clamp(self.min_instances, self.max_instances)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("policy id must not be empty".to_string());
        }
        if self.component_id.trim().is_empty() {
            return Err("component_id must not be empty".to_string());
        }
        if self.max_instances == 0 || self.min_instances > self.max_instances {
            return Err(format!(
                "instance bounds {}..={} are invalid",
                self.min_instances, self.max_instances
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err("scaling steps must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A routable instance of a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Changed only by health checking
    #[serde(default = "default_enabled")]
    pub healthy: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: Option<ScalingMetrics>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: 1,
            healthy: true,
            last_health_check: None,
            metrics: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn active_connections(&self) -> u64 {
        self.metrics.as_ref().map_or(0, |m| m.active_connections)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
}

impl fmt::Display for RoutingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::Weighted => "weighted",
            Self::IpHash => "ip-hash",
        };
        f.write_str(name)
    }
}

/// How an instance is probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// GET the instance's health path; 2xx is healthy
    Http,
    /// TCP connect to host:port
    #[default]
    Tcp,
    /// Run a command; exit status 0 is healthy
    Command,
    /// JSON health call; `{"status": "ok"|"healthy"|"serving"}` is healthy
    Rpc,
}
