//! # Circuit Breaker Metrics
//!
//! Per-breaker counters and a system-wide aggregate used by health reporting.

use super::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the dependency
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    /// Successful probes since entering half-open
    pub half_open_successes: u64,
    /// Calls short-circuited without reaching the dependency
    pub rejected_calls: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
            rejected_calls: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in the derived rate fields
    pub(crate) fn with_derived(mut self, state: CircuitState) -> Self {
        self.current_state = state;
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
            self.average_duration = self.total_duration / self.total_calls as u32;
        }
        self
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Admitting a single probe",
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// System-wide circuit breaker metrics aggregator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
}

impl SystemCircuitBreakerMetrics {
    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(name, metrics);
    }

    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// Share of healthy breakers (0.0 to 1.0); no breakers counts as healthy
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }
        let healthy = self
            .circuit_breakers
            .values()
            .filter(|m| m.is_healthy())
            .count();
        healthy as f64 / self.circuit_breakers.len() as f64
    }

    pub fn open_circuits(&self) -> Vec<&str> {
        let mut open: Vec<&str> = self
            .circuit_breakers
            .iter()
            .filter(|(_, m)| m.current_state == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        open.sort_unstable();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score() {
        let mut system = SystemCircuitBreakerMetrics::default();
        assert_eq!(system.health_score(), 1.0);

        system.add_circuit_breaker(
            "registry".to_string(),
            CircuitBreakerMetrics::new().with_derived(CircuitState::Closed),
        );
        system.add_circuit_breaker(
            "builder".to_string(),
            CircuitBreakerMetrics::new().with_derived(CircuitState::Open),
        );

        assert_eq!(system.health_score(), 0.5);
        assert_eq!(system.open_circuits(), vec!["builder"]);
        assert_eq!(system.count_by_state()[&CircuitState::Open], 1);
    }
}
