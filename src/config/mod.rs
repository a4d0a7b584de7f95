//! # Orchestrator Configuration System
//!
//! Layered, environment-aware configuration for the orchestration core.
//!
//! ## Architecture
//!
//! - **Defaults in code**: every section has a `Default` so partial files work
//! - **Layered sources**: `orchestrator.yaml`, then `orchestrator.{env}.yaml`, then
//!   `ORCHESTRATOR__SECTION__KEY` environment variables
//! - **Explicit validation**: inconsistent values fail loading instead of being
//!   silently corrected
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orchestrator_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let depth = manager.config().queue.max_queue_depth;
//! let tick = manager.config().scaling.evaluation_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::{ConfigManager, BASE_CONFIG_FILE, ENV_PREFIX};

use crate::constants::system;
use crate::deployment::promotion::PromotionStage;
use crate::orchestration::types::WorkPriority;
use crate::resilience::CircuitBreakerSettings;
use crate::scaling::types::{ProbeMethod, RoutingAlgorithm, ScalingPolicy};

/// Root configuration structure mirroring `orchestrator.yaml`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deployment environment this orchestrator instance serves
    pub environment: String,

    /// Work queue sizing and load shedding
    pub queue: QueueConfig,

    /// Retry and backoff policy for downstream calls
    pub backoff: BackoffConfig,

    /// Circuit breaker configuration for downstream dependencies
    pub circuit_breakers: CircuitBreakerConfig,

    /// Event store settings
    pub events: EventsConfig,

    /// Deployment orchestration settings
    pub deployment: DeploymentSettings,

    /// Autoscaling settings
    pub scaling: ScalingSettings,

    /// Routing defaults
    pub load_balancer: LoadBalancerSettings,

    /// Default health check settings for registered components
    pub health_checks: HealthCheckSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
            events: EventsConfig::default(),
            deployment: DeploymentSettings::default(),
            scaling: ScalingSettings::default(),
            load_balancer: LoadBalancerSettings::default(),
            health_checks: HealthCheckSettings::default(),
        }
    }
}

/// Queue sizing and graceful degradation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Depth at which lower-priority submissions are shed
    pub max_queue_depth: usize,
    /// Submissions with a priority below this tier are rejected when saturated
    pub shed_below_priority: WorkPriority,
    pub processing_interval_ms: u64,
    pub max_concurrent_requests: usize,
}

impl QueueConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 1_000,
            shed_below_priority: WorkPriority::High,
            processing_interval_ms: 50,
            max_concurrent_requests: 4,
        }
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_enabled: bool,
    pub jitter_max_percentage: f64,
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 3,
            jitter_enabled: false,
            jitter_max_percentage: 0.1,
        }
    }
}

/// Circuit breaker configuration integrated with YAML config
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether breakers guard downstream calls at all
    pub enabled: bool,

    /// Default configuration for new circuit breakers
    pub default_config: CircuitBreakerComponentConfig,

    /// Specific configurations for named dependencies
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl CircuitBreakerConfig {
    /// Configuration for a dependency, falling back to the default
    pub fn config_for_component(&self, component_name: &str) -> CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs: HashMap::new(),
        }
    }
}

/// Circuit breaker configuration for a specific dependency
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time in the open state before a probe is admitted
    pub timeout_seconds: u64,
    /// Successful probes needed to close again
    pub success_threshold: u32,
}

impl CircuitBreakerComponentConfig {
    pub fn to_resilience_config(&self) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            success_threshold: self.success_threshold,
        }
    }
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60,
            success_threshold: 1,
        }
    }
}

/// Event store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the live subscription channel; lagging subscribers skip ahead
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: system::DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Deployment orchestration settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeploymentSettings {
    pub default_rollback_timeout_seconds: u64,
    pub approval_timeout_seconds: u64,
    pub default_check_timeout_ms: u64,
    pub default_check_retries: u32,
    /// Ordered promotion pipeline, earliest environment first
    pub promotion_stages: Vec<PromotionStage>,
}

impl DeploymentSettings {
    pub fn default_rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.default_rollback_timeout_seconds)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    pub fn default_check_timeout(&self) -> Duration {
        Duration::from_millis(self.default_check_timeout_ms)
    }
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            default_rollback_timeout_seconds: 300,
            approval_timeout_seconds: 24 * 60 * 60,
            default_check_timeout_ms: 30_000,
            default_check_retries: 1,
            promotion_stages: PromotionStage::default_pipeline(),
        }
    }
}

/// Autoscaling settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalingSettings {
    pub evaluation_interval_ms: u64,
    pub metrics_window_seconds: u64,
    pub max_samples_per_component: usize,
    /// Policies installed at startup; more can be hot-loaded later
    pub policies: Vec<ScalingPolicy>,
    pub bottleneck: BottleneckThresholds,
    pub cost: CostModelConfig,
}

impl ScalingSettings {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_seconds)
    }
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 30_000,
            metrics_window_seconds: 300,
            max_samples_per_component: 1_000,
            policies: Vec::new(),
            bottleneck: BottleneckThresholds::default(),
            cost: CostModelConfig::default(),
        }
    }
}

/// Severity thresholds for bottleneck detection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BottleneckThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub response_time_warning_ms: f64,
    pub response_time_critical_ms: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub queue_length_warning: f64,
    pub queue_length_critical: f64,
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 75.0,
            cpu_critical: 90.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
            response_time_warning_ms: 1_000.0,
            response_time_critical_ms: 3_000.0,
            error_rate_warning: 0.01,
            error_rate_critical: 0.05,
            queue_length_warning: 100.0,
            queue_length_critical: 500.0,
        }
    }
}

/// Inputs to the downsizing cost model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CostModelConfig {
    /// Flat hourly cost of one instance
    pub instance_hourly_cost: f64,
    /// Utilization percentage below which a component counts as underused
    pub low_utilization_threshold: f64,
    /// Utilization percentage the recommended size should land at
    pub target_utilization: f64,
    /// Samples required before a recommendation is made
    pub min_samples: usize,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            instance_hourly_cost: 0.10,
            low_utilization_threshold: 30.0,
            target_utilization: 60.0,
            min_samples: 10,
        }
    }
}

/// Routing defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerSettings {
    pub default_algorithm: RoutingAlgorithm,
    /// Fixed seed for weighted selection; random when absent
    pub weighted_seed: Option<u64>,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            default_algorithm: RoutingAlgorithm::RoundRobin,
            weighted_seed: None,
        }
    }
}

/// Health check defaults applied to components without explicit settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub method: ProbeMethod,
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 2_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            method: ProbeMethod::Tcp,
        }
    }
}

impl OrchestratorConfig {
    /// Cross-field validation of the merged configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.max_queue_depth == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_queue_depth",
                0,
                "must be greater than 0",
            ));
        }
        if self.queue.max_concurrent_requests == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_concurrent_requests",
                0,
                "must be greater than 0",
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_attempts",
                0,
                "must allow at least one attempt",
            ));
        }
        if self.backoff.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.backoff_multiplier",
                self.backoff.backoff_multiplier,
                "must be >= 1.0",
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigurationError::validation_error(format!(
                "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_max_percentage",
                self.backoff.jitter_max_percentage,
                "must be within 0.0..=1.0",
            ));
        }

        let breaker_configs = std::iter::once(("default", &self.circuit_breakers.default_config))
            .chain(
                self.circuit_breakers
                    .component_configs
                    .iter()
                    .map(|(name, cfg)| (name.as_str(), cfg)),
            );
        for (name, cfg) in breaker_configs {
            cfg.to_resilience_config().validate().map_err(|e| {
                ConfigurationError::validation_error(format!("circuit_breakers.{name}: {e}"))
            })?;
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "must be greater than 0",
            ));
        }

        for policy in &self.scaling.policies {
            policy.validate().map_err(|e| {
                ConfigurationError::validation_error(format!("scaling.policies.{}: {e}", policy.id))
            })?;
        }
        if self.scaling.evaluation_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "scaling.evaluation_interval_ms",
                0,
                "must be greater than 0",
            ));
        }
        let cost = &self.scaling.cost;
        if cost.instance_hourly_cost < 0.0 {
            return Err(ConfigurationError::invalid_value(
                "scaling.cost.instance_hourly_cost",
                cost.instance_hourly_cost,
                "must not be negative",
            ));
        }
        if cost.target_utilization <= 0.0 || cost.target_utilization > 100.0 {
            return Err(ConfigurationError::invalid_value(
                "scaling.cost.target_utilization",
                cost.target_utilization,
                "must be within (0, 100]",
            ));
        }

        if self.health_checks.healthy_threshold == 0 || self.health_checks.unhealthy_threshold == 0
        {
            return Err(ConfigurationError::validation_error(
                "health_checks thresholds must be greater than 0",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.deployment.promotion_stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigurationError::validation_error(format!(
                    "deployment.promotion_stages contains duplicate stage '{}'",
                    stage.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.shed_below_priority, WorkPriority::High);
        assert_eq!(config.backoff.base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let json = serde_json::json!({
            "queue": { "max_queue_depth": 10 },
            "circuit_breakers": {
                "component_configs": { "registry": { "failure_threshold": 3 } }
            }
        });
        let config: OrchestratorConfig = serde_json::from_value(json).unwrap();

        assert_eq!(config.queue.max_queue_depth, 10);
        assert_eq!(config.queue.max_concurrent_requests, 4);
        let registry = config.circuit_breakers.config_for_component("registry");
        assert_eq!(registry.failure_threshold, 3);
        assert_eq!(registry.timeout_seconds, 60);
        let other = config.circuit_breakers.config_for_component("other");
        assert_eq!(other.failure_threshold, 5);
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = OrchestratorConfig::default();
        config.backoff.base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.backoff.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_breaker() {
        let mut config = OrchestratorConfig::default();
        config.circuit_breakers.component_configs.insert(
            "broken".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 0,
                ..Default::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circuit_breakers.broken"));
    }
}
