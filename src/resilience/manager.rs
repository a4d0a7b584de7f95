//! # Circuit Breaker Manager
//!
//! Owns one breaker per dependency key, created lazily from configuration.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use super::metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
use crate::config::CircuitBreakerConfig;
use crate::events::EventStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of circuit breakers keyed by dependency name
#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    events: EventStore,
}

impl CircuitBreakerManager {
    pub fn from_config(config: &CircuitBreakerConfig, events: EventStore) -> Self {
        info!(
            enabled = config.enabled,
            component_overrides = config.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: DashMap::new(),
            config: config.clone(),
            events,
        }
    }

    /// Whether calls should be guarded at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get or create circuit breaker for a dependency
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(component_name) {
            return Arc::clone(breaker.value());
        }

        // The entry lock makes creation race-free for one key
        let breaker = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let settings = self
                    .config
                    .config_for_component(component_name)
                    .to_resilience_config();
                info!(component = component_name, "Created new circuit breaker");
                Arc::new(CircuitBreaker::with_events(
                    component_name.to_string(),
                    settings,
                    self.events.clone(),
                ))
            });
        Arc::clone(breaker.value())
    }

    /// Existing breaker, without creating one
    pub fn get(&self, component_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers
            .get(component_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Current state of every breaker, keyed by dependency
    pub fn status(&self) -> HashMap<String, CircuitBreakerState> {
        self.circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn get_component_metrics(&self, component_name: &str) -> Option<CircuitBreakerMetrics> {
        self.get(component_name).map(|breaker| breaker.metrics())
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::default();
        for entry in self.circuit_breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system_metrics
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    pub fn remove_circuit_breaker(&self, component_name: &str) -> bool {
        self.circuit_breakers.remove(component_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerComponentConfig;
    use crate::resilience::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_breakers_use_component_overrides() {
        let mut config = CircuitBreakerConfig::default();
        config.component_configs.insert(
            "registry".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 2,
                timeout_seconds: 5,
                success_threshold: 1,
            },
        );
        let manager = CircuitBreakerManager::from_config(&config, EventStore::default());

        let registry = manager.get_circuit_breaker("registry");
        assert_eq!(registry.config().failure_threshold, 2);
        assert_eq!(registry.config().timeout, Duration::from_secs(5));

        let other = manager.get_circuit_breaker("builder");
        assert_eq!(other.config().failure_threshold, 5);

        assert!(Arc::ptr_eq(&registry, &manager.get_circuit_breaker("registry")));
        assert_eq!(manager.list_components(), vec!["builder", "registry"]);
    }

    #[test]
    fn test_status_reports_each_key() {
        let manager =
            CircuitBreakerManager::from_config(&CircuitBreakerConfig::default(), EventStore::default());
        manager.get_circuit_breaker("a").force_open();
        manager.get_circuit_breaker("b");

        let status = manager.status();
        assert_eq!(status["a"].state, CircuitState::Open);
        assert_eq!(status["b"].state, CircuitState::Closed);
        assert_eq!(manager.get_system_metrics().health_score(), 0.5);
    }
}
