//! # Circuit Breaker Settings
//!
//! Runtime settings for a single breaker. The YAML-facing form lives in
//! `crate::config::CircuitBreakerComponentConfig` and converts into this one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before admitting a probe
    pub timeout: Duration,

    /// Number of successful probes in half-open state to close circuit
    pub success_threshold: u32,
}

impl CircuitBreakerSettings {
    /// Settings for deployment infrastructure targets
    pub fn for_deployment_target() -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }

    /// Settings for external collaborator calls (generators, registries)
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(45),
            success_threshold: 2,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.timeout.is_zero() {
            return Err("timeout must be greater than 0".to_string());
        }

        if self.timeout > Duration::from_secs(3_600) {
            return Err("timeout should not exceed 3600 seconds".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.success_threshold > 50 {
            return Err("success_threshold should not exceed 50".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validation() {
        assert!(CircuitBreakerSettings::default().validate().is_ok());

        let mut invalid = CircuitBreakerSettings {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        invalid = CircuitBreakerSettings {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        invalid = CircuitBreakerSettings {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(CircuitBreakerSettings::for_deployment_target()
            .validate()
            .is_ok());
        assert!(CircuitBreakerSettings::for_external_api().validate().is_ok());
    }
}
