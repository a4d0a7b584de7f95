//! # Deployment Types
//!
//! Configuration accepted by `create_deployment`, the strategy variants parsed
//! from it, and the records and results handed back to callers.

use crate::error::{ErrorCategory, ErrorInfo, OrchestratorError, Result};
use crate::state_machine::{DeploymentStatus, StateTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::validation::{CheckSpec, ValidationResult};

/// Configuration of one deployment; read-only once execution starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Generated when empty
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Strategy identifier: `blue-green`, `canary` or `rolling`
    pub strategy: String,
    pub environment: String,
    #[serde(default)]
    pub components: Vec<String>,
    /// Opaque artifact reference (image tag, package version)
    pub artifact: String,
    #[serde(default)]
    pub previous_artifact: Option<String>,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub settings: StrategySettings,
    /// Deployment this one was promoted from
    #[serde(default)]
    pub promoted_from: Option<String>,
}

impl DeploymentConfig {
    pub fn new(
        strategy: impl Into<String>,
        environment: impl Into<String>,
        artifact: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            strategy: strategy.into(),
            environment: environment.into(),
            components: Vec::new(),
            artifact: artifact.into(),
            previous_artifact: None,
            validation: ValidationRules::default(),
            rollback: RollbackPolicy::default(),
            analytics: AnalyticsConfig::default(),
            settings: StrategySettings::default(),
            promoted_from: None,
        }
    }

    /// Assign an id if none was supplied
    pub(crate) fn ensure_id(&mut self) {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.name.is_empty() {
            self.name = format!("{}-{}", self.environment, self.artifact);
        }
    }

    /// Shape checks independent of the strategy
    pub fn validate_shape(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(OrchestratorError::validation("environment must not be empty"));
        }
        if self.artifact.trim().is_empty() {
            return Err(OrchestratorError::validation("artifact must not be empty"));
        }
        let mut names = std::collections::HashSet::new();
        for check in &self.validation.checks {
            if check.name.trim().is_empty() {
                return Err(OrchestratorError::validation("validation check names must not be empty"));
            }
            if !names.insert(check.name.as_str()) {
                return Err(OrchestratorError::validation(format!(
                    "duplicate validation check '{}'",
                    check.name
                )));
            }
        }
        Ok(())
    }
}

/// Strategy-specific settings; only the selected strategy's block is read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub blue_green: BlueGreenSettings,
    pub canary: CanarySettings,
    pub rolling: RollingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenSettings {
    /// Traffic percentages for gradual cutover; empty switches atomically
    pub cutover_steps: Vec<u8>,
    pub step_interval_ms: u64,
    /// Window after the switch during which a breach reverts traffic
    pub warm_up_seconds: u64,
    pub warm_up_check_interval_ms: u64,
    pub thresholds: Vec<MetricThreshold>,
}

impl Default for BlueGreenSettings {
    fn default() -> Self {
        Self {
            cutover_steps: Vec::new(),
            step_interval_ms: 5_000,
            warm_up_seconds: 60,
            warm_up_check_interval_ms: 10_000,
            thresholds: vec![MetricThreshold::below("error_rate", 0.05)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryStage {
    pub percentage: u8,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub thresholds: Vec<MetricThreshold>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanarySettings {
    pub stages: Vec<CanaryStage>,
    /// Continuous analysis period within a stage; only stage ends when absent
    pub analysis_interval_ms: Option<u64>,
    /// Advance through passing stages without operator action
    pub auto_promote: bool,
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            stages: vec![
                CanaryStage {
                    percentage: 10,
                    duration_seconds: 300,
                    thresholds: vec![MetricThreshold::below("error_rate", 0.05)],
                },
                CanaryStage {
                    percentage: 50,
                    duration_seconds: 300,
                    thresholds: vec![MetricThreshold::below("error_rate", 0.05)],
                },
            ],
            analysis_interval_ms: None,
            auto_promote: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingSettings {
    /// Replica count used when the environment has no running instances
    pub replicas: u32,
    pub batch_size: u32,
    pub max_unavailable: u32,
    pub max_surge: u32,
    pub pause_between_batches_ms: u64,
    pub progress_deadline_seconds: u64,
}

impl RollingSettings {
    /// Effective batch length honoring the availability budget
    pub fn batch_len(&self) -> u32 {
        self.batch_size
            .min(self.max_unavailable.saturating_add(self.max_surge))
    }

    pub fn progress_deadline(&self) -> Duration {
        Duration::from_secs(self.progress_deadline_seconds)
    }
}

impl Default for RollingSettings {
    fn default() -> Self {
        Self {
            replicas: 3,
            batch_size: 1,
            max_unavailable: 1,
            max_surge: 0,
            pause_between_batches_ms: 1_000,
            progress_deadline_seconds: 600,
        }
    }
}

/// Closed set of rollout algorithms
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentStrategy {
    BlueGreen(BlueGreenSettings),
    Canary(CanarySettings),
    Rolling(RollingSettings),
}

impl DeploymentStrategy {
    /// Parse and validate the strategy named in `config`
    pub fn from_config(config: &DeploymentConfig) -> Result<Self> {
        let normalized = config.strategy.trim().to_lowercase().replace('_', "-");
        let strategy = match normalized.as_str() {
            "blue-green" | "bluegreen" => Self::BlueGreen(config.settings.blue_green.clone()),
            "canary" => Self::Canary(config.settings.canary.clone()),
            "rolling" => Self::Rolling(config.settings.rolling.clone()),
            _ => {
                return Err(OrchestratorError::validation(format!(
                    "unknown deployment strategy '{}' (expected blue-green, canary or rolling)",
                    config.strategy
                )))
            }
        };
        strategy.validate()?;
        Ok(strategy)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::BlueGreen(settings) => {
                let mut previous = 0u8;
                for step in &settings.cutover_steps {
                    if *step == 0 || *step > 100 || *step <= previous {
                        return Err(OrchestratorError::validation(
                            "blue-green cutover_steps must be strictly increasing within 1..=100",
                        ));
                    }
                    previous = *step;
                }
                if settings.warm_up_seconds > 0 && settings.warm_up_check_interval_ms == 0 {
                    return Err(OrchestratorError::validation(
                        "blue-green warm_up_check_interval_ms must be greater than 0",
                    ));
                }
            }
            Self::Canary(settings) => {
                if settings.stages.is_empty() {
                    return Err(OrchestratorError::validation(
                        "canary deployments need at least one stage",
                    ));
                }
                let mut previous = 0u8;
                for stage in &settings.stages {
                    if stage.percentage == 0 || stage.percentage > 100 || stage.percentage <= previous
                    {
                        return Err(OrchestratorError::validation(
                            "canary stage percentages must be strictly increasing within 1..=100",
                        ));
                    }
                    previous = stage.percentage;
                }
                if settings.analysis_interval_ms == Some(0) {
                    return Err(OrchestratorError::validation(
                        "canary analysis_interval_ms must be greater than 0",
                    ));
                }
            }
            Self::Rolling(settings) => {
                if settings.batch_size == 0 {
                    return Err(OrchestratorError::validation(
                        "rolling batch_size must be greater than 0",
                    ));
                }
                if settings.batch_len() == 0 {
                    return Err(OrchestratorError::validation(
                        "rolling max_unavailable + max_surge must be greater than 0",
                    ));
                }
                if settings.progress_deadline_seconds == 0 {
                    return Err(OrchestratorError::validation(
                        "rolling progress_deadline_seconds must be greater than 0",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::BlueGreen(_) => StrategyKind::BlueGreen,
            Self::Canary(_) => StrategyKind::Canary,
            Self::Rolling(_) => StrategyKind::Rolling,
        }
    }

    /// Blue-green switches traffic in one decision and cannot be paused
    pub fn is_pausable(&self) -> bool {
        !matches!(self, Self::BlueGreen(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    BlueGreen,
    Canary,
    Rolling,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlueGreen => write!(f, "blue-green"),
            Self::Canary => write!(f, "canary"),
            Self::Rolling => write!(f, "rolling"),
        }
    }
}

/// Comparison used by metric thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A metric bound that must hold, e.g. `error_rate < 0.05`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub metric: String,
    pub operator: ThresholdOperator,
    pub value: f64,
}

impl MetricThreshold {
    pub fn below(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            operator: ThresholdOperator::Lt,
            value,
        }
    }

    pub fn above(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            operator: ThresholdOperator::Gt,
            value,
        }
    }

    /// `None` when the metric was not observed
    pub fn is_satisfied(&self, metrics: &ObservedMetrics) -> Option<bool> {
        let observed = metrics.get(&self.metric)?;
        Some(match self.operator {
            ThresholdOperator::Lt => observed < self.value,
            ThresholdOperator::Lte => observed <= self.value,
            ThresholdOperator::Gt => observed > self.value,
            ThresholdOperator::Gte => observed >= self.value,
        })
    }
}

impl fmt::Display for MetricThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Lte => "<=",
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Gte => ">=",
        };
        write!(f, "{} {} {}", self.metric, op, self.value)
    }
}

/// Metrics observed for a deployed artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservedMetrics {
    pub error_rate: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub request_rate: Option<f64>,
    pub custom: HashMap<String, f64>,
}

impl ObservedMetrics {
    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = Some(error_rate);
        self
    }

    pub fn with_response_time(mut self, response_time_ms: f64) -> Self {
        self.response_time_ms = Some(response_time_ms);
        self
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        match metric {
            "error_rate" => self.error_rate,
            "response_time" | "response_time_ms" => self.response_time_ms,
            "cpu" => self.cpu,
            "memory" => self.memory,
            "request_rate" => self.request_rate,
            other => self.custom.get(other).copied(),
        }
    }
}

/// Validation checks attached to a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Run the infrastructure readiness probe before executing
    pub require_infrastructure_ready: bool,
    pub checks: Vec<CheckSpec>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            require_infrastructure_ready: true,
            checks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackPolicy {
    /// Roll back automatically when the strategy fails
    pub automatic: bool,
    /// Overrides the configured default rollback timeout
    pub timeout_seconds: Option<u64>,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            automatic: true,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub tags: HashMap<String, String>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Measurements collected while a deployment runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    pub duration_ms: u64,
    /// Share of traffic on the new artifact
    pub traffic_percentage: u8,
    pub instances_launched: u32,
    pub instances_terminated: u32,
    pub max_unavailable_observed: u32,
    pub canary_stages_completed: u32,
    pub last_observed: Option<ObservedMetrics>,
}

/// Current state of a deployment, owned by the deployment orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub config_id: String,
    pub name: String,
    pub strategy: String,
    pub environment: String,
    pub artifact: String,
    pub status: DeploymentStatus,
    /// 0.0 to 100.0
    pub progress: f64,
    pub logs: Vec<DeploymentLogEntry>,
    pub metrics: DeploymentMetrics,
    pub validation: Option<ValidationResult>,
    pub error: Option<ErrorInfo>,
    pub rollback_count: u32,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    pub(crate) fn new(config: &DeploymentConfig) -> Self {
        let now = Utc::now();
        Self {
            config_id: config.id.clone(),
            name: config.name.clone(),
            strategy: config.strategy.clone(),
            environment: config.environment.clone(),
            artifact: config.artifact.clone(),
            status: DeploymentStatus::Pending,
            progress: 0.0,
            logs: Vec::new(),
            metrics: DeploymentMetrics::default(),
            validation: None,
            error: None,
            rollback_count: 0,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub(crate) fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= crate::constants::system::MAX_DEPLOYMENT_LOG_ENTRIES {
            self.logs.remove(0);
        }
        let now = Utc::now();
        self.logs.push(DeploymentLogEntry {
            at: now,
            level,
            message: message.into(),
        });
        self.updated_at = now;
    }
}

/// Structured outcome of deployment operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub deployment_id: String,
    /// `None` when no such deployment exists
    pub status: Option<DeploymentStatus>,
    pub message: String,
    pub category: Option<ErrorCategory>,
}

impl DeploymentResult {
    pub fn ok(deployment_id: &str, status: DeploymentStatus, message: impl Into<String>) -> Self {
        Self {
            success: true,
            deployment_id: deployment_id.to_string(),
            status: Some(status),
            message: message.into(),
            category: None,
        }
    }

    pub fn error(
        deployment_id: &str,
        status: Option<DeploymentStatus>,
        error: &OrchestratorError,
    ) -> Self {
        Self {
            success: false,
            deployment_id: deployment_id.to_string(),
            status,
            message: error.to_string(),
            category: Some(error.category()),
        }
    }
}

/// Outcome of `promote_deployment`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionResult {
    pub success: bool,
    pub source_deployment_id: String,
    pub from: String,
    pub to: String,
    pub new_deployment_id: Option<String>,
    /// Approval that gates this promotion, when one is configured
    pub approval_id: Option<String>,
    pub message: String,
    pub category: Option<ErrorCategory>,
}

/// Filter for listing deployments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentFilter {
    pub environment: Option<String>,
    pub status: Option<DeploymentStatus>,
}

impl DeploymentFilter {
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.environment
            .as_deref()
            .map_or(true, |env| record.environment == env)
            && self.status.map_or(true, |status| record.status == status)
    }
}

/// Arbitrary JSON payloads carried by work requests must parse into a config
impl TryFrom<Value> for DeploymentConfig {
    type Error = OrchestratorError;

    fn try_from(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| OrchestratorError::validation(format!("invalid deployment config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_strategy_is_validation_error() {
        let config = DeploymentConfig::new("invalid-strategy", "staging", "api:1.2.0");
        let err = DeploymentStrategy::from_config(&config).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("invalid-strategy"));
    }

    #[test]
    fn test_strategy_aliases() {
        for name in ["blue-green", "blue_green", "BlueGreen", "canary", "Rolling"] {
            let config = DeploymentConfig::new(name, "staging", "api:1.2.0");
            assert!(DeploymentStrategy::from_config(&config).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_rolling_batch_bounded_by_budget() {
        let settings = RollingSettings {
            batch_size: 5,
            max_unavailable: 1,
            max_surge: 1,
            ..Default::default()
        };
        assert_eq!(settings.batch_len(), 2);

        let mut config = DeploymentConfig::new("rolling", "prod", "api:2");
        config.settings.rolling.max_unavailable = 0;
        config.settings.rolling.max_surge = 0;
        assert!(DeploymentStrategy::from_config(&config).is_err());
    }

    #[test]
    fn test_canary_stages_must_increase() {
        let mut config = DeploymentConfig::new("canary", "prod", "api:2");
        config.settings.canary.stages = vec![
            CanaryStage {
                percentage: 50,
                duration_seconds: 1,
                thresholds: vec![],
            },
            CanaryStage {
                percentage: 10,
                duration_seconds: 1,
                thresholds: vec![],
            },
        ];
        assert!(DeploymentStrategy::from_config(&config).is_err());
    }

    #[test]
    fn test_threshold_evaluation() {
        let metrics = ObservedMetrics::default().with_error_rate(0.10);
        assert_eq!(
            MetricThreshold::below("error_rate", 0.05).is_satisfied(&metrics),
            Some(false)
        );
        assert_eq!(
            MetricThreshold::below("response_time", 100.0).is_satisfied(&metrics),
            None
        );
        assert_eq!(
            MetricThreshold::below("error_rate", 0.05).to_string(),
            "error_rate < 0.05"
        );
    }
}
