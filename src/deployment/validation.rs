//! # Deployment Validation
//!
//! Pre-deployment readiness and post-deployment smoke, health, performance and
//! security checks. Every check has its own timeout and retry budget; a
//! deployment validates when all `required` checks pass.

use super::target::{CheckOutcome, DeploymentTarget};
use super::types::{DeploymentConfig, MetricThreshold};
use crate::constants::events;
use crate::error::OrchestratorError;
use crate::events::EventStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Name of the implicit readiness check
pub const INFRASTRUCTURE_READINESS_CHECK: &str = "infrastructure-readiness";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckPhase {
    Pre,
    Smoke,
    Health,
    Performance,
    Security,
}

impl CheckPhase {
    pub fn is_post_deployment(&self) -> bool {
        !matches!(self, Self::Pre)
    }
}

impl fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pre => "pre",
            Self::Smoke => "smoke",
            Self::Health => "health",
            Self::Performance => "performance",
            Self::Security => "security",
        };
        f.write_str(label)
    }
}

fn default_required() -> bool {
    true
}

/// A named check attached to a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub phase: CheckPhase,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Additional attempts after the first failure
    #[serde(default)]
    pub retries: Option<u32>,
    /// When present the check is evaluated against observed metrics
    #[serde(default)]
    pub thresholds: Vec<MetricThreshold>,
    /// Passed through to the target unchanged
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl CheckSpec {
    pub fn new(name: impl Into<String>, phase: CheckPhase) -> Self {
        Self {
            name: name.into(),
            phase,
            required: true,
            timeout_ms: None,
            retries: None,
            thresholds: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<MetricThreshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub phase: CheckPhase,
    pub passed: bool,
    pub score: f64,
    pub required: bool,
    pub attempts: u32,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub deployment_id: String,
    pub success: bool,
    /// Mean score across checks, 1.0 when nothing ran
    pub score: f64,
    pub checks: Vec<CheckResult>,
    pub message: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    fn from_checks(deployment_id: &str, checks: Vec<CheckResult>) -> Self {
        let failed_required: Vec<&str> = checks
            .iter()
            .filter(|c| c.required && !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        let success = failed_required.is_empty();
        let score = if checks.is_empty() {
            1.0
        } else {
            checks.iter().map(|c| c.score).sum::<f64>() / checks.len() as f64
        };
        let message = if success {
            format!("{} checks passed", checks.iter().filter(|c| c.passed).count())
        } else {
            format!("required checks failed: {}", failed_required.join(", "))
        };

        Self {
            deployment_id: deployment_id.to_string(),
            success,
            score,
            checks,
            message,
            validated_at: Utc::now(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Runs deployment checks against a [`DeploymentTarget`]
#[derive(Debug, Clone)]
pub struct ValidationManager {
    target: Arc<dyn DeploymentTarget>,
    events: EventStore,
    default_timeout: Duration,
    default_retries: u32,
}

impl ValidationManager {
    pub fn new(
        target: Arc<dyn DeploymentTarget>,
        events: EventStore,
        default_timeout: Duration,
        default_retries: u32,
    ) -> Self {
        Self {
            target,
            events,
            default_timeout,
            default_retries,
        }
    }

    /// Infrastructure readiness plus `pre` phase checks
    pub async fn run_pre_deployment(&self, config: &DeploymentConfig) -> ValidationResult {
        let mut results = Vec::new();
        if config.validation.require_infrastructure_ready {
            results.push(self.check_readiness(&config.environment).await);
        }

        let checks: Vec<&CheckSpec> = config
            .validation
            .checks
            .iter()
            .filter(|c| c.phase == CheckPhase::Pre)
            .collect();
        results.extend(
            self.run_each(&config.environment, &config.artifact, &checks)
                .await,
        );

        self.finish(&config.id, "pre", results)
    }

    /// Smoke, health, performance and security checks
    pub async fn run_post_deployment(&self, config: &DeploymentConfig) -> ValidationResult {
        let checks: Vec<&CheckSpec> = config
            .validation
            .checks
            .iter()
            .filter(|c| c.phase.is_post_deployment())
            .collect();
        let results = self
            .run_each(&config.environment, &config.artifact, &checks)
            .await;
        self.finish(&config.id, "post", results)
    }

    /// Run the given phases against an explicit environment, e.g. a blue-green slot
    pub async fn run_phases(
        &self,
        config: &DeploymentConfig,
        environment: &str,
        phases: &[CheckPhase],
    ) -> ValidationResult {
        let checks: Vec<&CheckSpec> = config
            .validation
            .checks
            .iter()
            .filter(|c| phases.contains(&c.phase))
            .collect();
        let results = self.run_each(environment, &config.artifact, &checks).await;
        self.finish(&config.id, environment, results)
    }

    async fn run_each(
        &self,
        environment: &str,
        artifact: &str,
        checks: &[&CheckSpec],
    ) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            results.push(self.run_check(environment, artifact, check).await);
        }
        results
    }

    /// Run one check with its timeout and retry budget
    pub async fn run_check(
        &self,
        environment: &str,
        artifact: &str,
        check: &CheckSpec,
    ) -> CheckResult {
        let timeout = check
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let max_attempts = check.retries.unwrap_or(self.default_retries) + 1;
        let started = Instant::now();

        let mut attempts = 0;
        let mut last = CheckOutcome::fail("not run");
        while attempts < max_attempts {
            attempts += 1;
            last = match tokio::time::timeout(timeout, self.attempt(environment, artifact, check))
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => CheckOutcome::fail(e.to_string()),
                Err(_) => CheckOutcome::fail(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )),
            };
            if last.passed {
                break;
            }
            debug!(
                check = %check.name,
                attempt = attempts,
                max_attempts = max_attempts,
                message = %last.message,
                "Validation check attempt failed"
            );
        }

        CheckResult {
            name: check.name.clone(),
            phase: check.phase,
            passed: last.passed,
            score: last.score.clamp(0.0, 1.0),
            required: check.required,
            attempts,
            message: last.message,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn attempt(
        &self,
        environment: &str,
        artifact: &str,
        check: &CheckSpec,
    ) -> crate::error::Result<CheckOutcome> {
        if check.thresholds.is_empty() {
            return self.target.run_check(environment, artifact, check).await;
        }

        let metrics = self.target.observe_metrics(environment, artifact).await?;
        let mut met = 0usize;
        let mut problems = Vec::new();
        for threshold in &check.thresholds {
            match threshold.is_satisfied(&metrics) {
                Some(true) => met += 1,
                Some(false) => problems.push(format!("{threshold} violated")),
                None => problems.push(format!("{} not observed", threshold.metric)),
            }
        }
        let score = met as f64 / check.thresholds.len() as f64;
        Ok(CheckOutcome {
            passed: problems.is_empty(),
            score,
            message: if problems.is_empty() {
                "all thresholds met".to_string()
            } else {
                problems.join("; ")
            },
        })
    }

    async fn check_readiness(&self, environment: &str) -> CheckResult {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.default_timeout,
            self.target.check_readiness(environment),
        )
        .await
        {
            Ok(Ok(())) => CheckOutcome::pass("infrastructure ready"),
            Ok(Err(e)) => CheckOutcome::fail(e.to_string()),
            Err(_) => CheckOutcome::fail(
                OrchestratorError::Timeout {
                    operation: format!("readiness check for {environment}"),
                    timeout_ms: self.default_timeout.as_millis() as u64,
                }
                .to_string(),
            ),
        };

        CheckResult {
            name: INFRASTRUCTURE_READINESS_CHECK.to_string(),
            phase: CheckPhase::Pre,
            passed: outcome.passed,
            score: outcome.score,
            required: true,
            attempts: 1,
            message: outcome.message,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn finish(&self, deployment_id: &str, stage: &str, checks: Vec<CheckResult>) -> ValidationResult {
        let result = ValidationResult::from_checks(deployment_id, checks);
        if result.success {
            info!(
                deployment_id = %deployment_id,
                stage = %stage,
                score = result.score,
                "✅ Deployment validation passed"
            );
        } else {
            warn!(
                deployment_id = %deployment_id,
                stage = %stage,
                message = %result.message,
                "⚠️ Deployment validation failed"
            );
        }

        self.events.append(
            events::DEPLOYMENT_VALIDATION_COMPLETED,
            Some(deployment_id),
            json!({
                "stage": stage,
                "success": result.success,
                "score": result.score,
                "message": result.message,
            }),
        );
        result
    }
}
