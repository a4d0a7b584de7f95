//! # Load Balancer
//!
//! Per-component instance registry and routing. Every algorithm selects among
//! healthy instances only, in registration order:
//!
//! - round-robin cycles through the healthy set
//! - least-connections picks the fewest active connections, earliest registered on ties
//! - weighted picks proportionally to `weight`
//! - ip-hash maps a client key to a fixed instance while the healthy set is unchanged
//!
//! With no healthy instance, selection returns `None` and records a
//! `load_balancer.no_healthy_instances` event.

use super::types::{RoutingAlgorithm, ScalingMetrics, ServiceInstance};
use crate::config::LoadBalancerSettings;
use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::EventStore;
use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
pub fn fnv1a_64(key: &str) -> u64 {
    key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Routing snapshot for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingStatus {
    pub component_id: String,
    pub algorithm: RoutingAlgorithm,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub requests_routed: u64,
    /// Selections per instance id
    pub distribution: HashMap<String, u64>,
}

#[derive(Debug)]
struct InstancePool {
    algorithm: RoutingAlgorithm,
    /// Registration order
    instances: Vec<ServiceInstance>,
    cursor: usize,
    rng: StdRng,
    routed: HashMap<String, u64>,
    requests_routed: u64,
}

impl InstancePool {
    fn new(algorithm: RoutingAlgorithm, seed: Option<u64>) -> Self {
        Self {
            algorithm,
            instances: Vec::new(),
            cursor: 0,
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            routed: HashMap::new(),
            requests_routed: 0,
        }
    }

    fn select(&mut self, client_key: Option<&str>) -> Option<ServiceInstance> {
        let healthy: Vec<&ServiceInstance> = self.instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return None;
        }

        let index = match (self.algorithm, client_key) {
            (RoutingAlgorithm::RoundRobin, _) | (RoutingAlgorithm::IpHash, None) => {
                let index = self.cursor % healthy.len();
                self.cursor = self.cursor.wrapping_add(1);
                index
            }
            (RoutingAlgorithm::LeastConnections, _) => healthy
                .iter()
                .enumerate()
                .min_by_key(|(_, instance)| instance.active_connections())
                .map_or(0, |(index, _)| index),
            (RoutingAlgorithm::Weighted, _) => {
                let total: u64 = healthy.iter().map(|i| u64::from(i.weight)).sum();
                if total == 0 {
                    self.rng.gen_range(0..healthy.len())
                } else {
                    let mut pick = self.rng.gen_range(0..total);
                    healthy
                        .iter()
                        .position(|instance| {
                            let weight = u64::from(instance.weight);
                            if pick < weight {
                                true
                            } else {
                                pick -= weight;
                                false
                            }
                        })
                        .unwrap_or(healthy.len() - 1)
                }
            }
            (RoutingAlgorithm::IpHash, Some(key)) => (fnv1a_64(key) % healthy.len() as u64) as usize,
        };

        let chosen = healthy[index].clone();
        *self.routed.entry(chosen.id.clone()).or_insert(0) += 1;
        self.requests_routed += 1;
        Some(chosen)
    }
}

#[derive(Debug)]
pub struct LoadBalancer {
    pools: DashMap<String, InstancePool>,
    settings: LoadBalancerSettings,
    events: EventStore,
}

impl LoadBalancer {
    pub fn new(settings: LoadBalancerSettings, events: EventStore) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
            events,
        }
    }

    fn new_pool(&self) -> InstancePool {
        InstancePool::new(self.settings.default_algorithm, self.settings.weighted_seed)
    }

    pub fn set_algorithm(&self, component_id: &str, algorithm: RoutingAlgorithm) {
        self.pools
            .entry(component_id.to_string())
            .or_insert_with(|| self.new_pool())
            .algorithm = algorithm;
        debug!(component_id = %component_id, algorithm = %algorithm, "Routing algorithm set");
    }

    pub fn algorithm(&self, component_id: &str) -> RoutingAlgorithm {
        self.pools
            .get(component_id)
            .map_or(self.settings.default_algorithm, |pool| pool.algorithm)
    }

    /// Add an instance; ids are unique within a component
    pub fn register_instance(&self, component_id: &str, instance: ServiceInstance) -> Result<()> {
        let mut pool = self
            .pools
            .entry(component_id.to_string())
            .or_insert_with(|| self.new_pool());
        if pool.instances.iter().any(|i| i.id == instance.id) {
            return Err(OrchestratorError::validation(format!(
                "instance {} is already registered for {component_id}",
                instance.id
            )));
        }

        info!(
            component_id = %component_id,
            instance_id = %instance.id,
            address = %instance.address(),
            weight = instance.weight,
            "➕ Instance registered"
        );
        self.events.append(
            events::INSTANCE_REGISTERED,
            Some(&instance.id),
            json!({
                "component_id": component_id,
                "address": instance.address(),
                "weight": instance.weight,
            }),
        );
        pool.instances.push(instance);
        Ok(())
    }

    pub fn unregister_instance(&self, component_id: &str, instance_id: &str) -> Result<ServiceInstance> {
        let mut pool = self
            .pools
            .get_mut(component_id)
            .ok_or_else(|| OrchestratorError::not_found("component", component_id))?;
        let position = pool
            .instances
            .iter()
            .position(|i| i.id == instance_id)
            .ok_or_else(|| OrchestratorError::not_found("instance", instance_id))?;
        let removed = pool.instances.remove(position);
        pool.routed.remove(instance_id);

        info!(component_id = %component_id, instance_id = %instance_id, "➖ Instance unregistered");
        self.events.append(
            events::INSTANCE_UNREGISTERED,
            Some(instance_id),
            json!({ "component_id": component_id }),
        );
        Ok(removed)
    }

    pub fn update_instance_metrics(
        &self,
        component_id: &str,
        instance_id: &str,
        metrics: ScalingMetrics,
    ) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(component_id)
            .ok_or_else(|| OrchestratorError::not_found("component", component_id))?;
        let instance = pool
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| OrchestratorError::not_found("instance", instance_id))?;
        instance.metrics = Some(metrics);
        Ok(())
    }

    /// Stamp a health check, setting the flag when `healthy` is given;
    /// returns the previous flag
    pub(crate) fn record_health_check(
        &self,
        component_id: &str,
        instance_id: &str,
        healthy: Option<bool>,
    ) -> Option<bool> {
        let mut pool = self.pools.get_mut(component_id)?;
        let instance = pool.instances.iter_mut().find(|i| i.id == instance_id)?;
        let previous = instance.healthy;
        if let Some(healthy) = healthy {
            instance.healthy = healthy;
        }
        instance.last_health_check = Some(Utc::now());
        Some(previous)
    }

    /// Pick an instance for a request; `client_key` drives ip-hash routing
    pub fn select_instance(&self, component_id: &str, client_key: Option<&str>) -> Option<ServiceInstance> {
        let selected = self
            .pools
            .get_mut(component_id)
            .and_then(|mut pool| pool.select(client_key));

        if selected.is_none() {
            warn!(component_id = %component_id, "⚠️ No healthy instances available");
            self.events.append(
                events::NO_HEALTHY_INSTANCES,
                Some(component_id),
                json!({ "algorithm": self.algorithm(component_id) }),
            );
        }
        selected
    }

    pub fn instances(&self, component_id: &str) -> Vec<ServiceInstance> {
        self.pools
            .get(component_id)
            .map(|pool| pool.instances.clone())
            .unwrap_or_default()
    }

    pub fn healthy_instances(&self, component_id: &str) -> Vec<ServiceInstance> {
        self.instances(component_id)
            .into_iter()
            .filter(|i| i.healthy)
            .collect()
    }

    /// `(component_id, instance)` for every registered instance
    pub fn all_instances(&self) -> Vec<(String, ServiceInstance)> {
        self.pools
            .iter()
            .flat_map(|pool| {
                let component = pool.key().clone();
                pool.instances
                    .iter()
                    .map(|i| (component.clone(), i.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn components(&self) -> Vec<String> {
        let mut components: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        components.sort();
        components
    }

    pub fn status(&self, component_id: &str) -> LoadBalancingStatus {
        match self.pools.get(component_id) {
            Some(pool) => LoadBalancingStatus {
                component_id: component_id.to_string(),
                algorithm: pool.algorithm,
                total_instances: pool.instances.len(),
                healthy_instances: pool.instances.iter().filter(|i| i.healthy).count(),
                requests_routed: pool.requests_routed,
                distribution: pool.routed.clone(),
            },
            None => LoadBalancingStatus {
                component_id: component_id.to_string(),
                algorithm: self.settings.default_algorithm,
                total_instances: 0,
                healthy_instances: 0,
                requests_routed: 0,
                distribution: HashMap::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(algorithm: RoutingAlgorithm) -> (LoadBalancer, EventStore) {
        let store = EventStore::default();
        let balancer = LoadBalancer::new(
            LoadBalancerSettings {
                default_algorithm: algorithm,
                weighted_seed: Some(7),
            },
            store.clone(),
        );
        for (id, weight) in [("i1", 1), ("i2", 2), ("i3", 1)] {
            balancer
                .register_instance("api", ServiceInstance::new(id, "10.0.0.1", 8080).with_weight(weight))
                .unwrap();
        }
        (balancer, store)
    }

    fn pick(balancer: &LoadBalancer, key: Option<&str>) -> String {
        balancer.select_instance("api", key).unwrap().id
    }

    #[test]
    fn test_round_robin_ignores_weight() {
        let (balancer, _) = balancer(RoutingAlgorithm::RoundRobin);
        let order: Vec<String> = (0..5).map(|_| pick(&balancer, None)).collect();
        assert_eq!(order, vec!["i1", "i2", "i3", "i1", "i2"]);
    }

    #[test]
    fn test_least_connections_ties_by_registration() {
        let (balancer, _) = balancer(RoutingAlgorithm::LeastConnections);
        assert_eq!(pick(&balancer, None), "i1");

        balancer
            .update_instance_metrics("api", "i1", ScalingMetrics::default().with_active_connections(5))
            .unwrap();
        balancer
            .update_instance_metrics("api", "i2", ScalingMetrics::default().with_active_connections(2))
            .unwrap();
        balancer
            .update_instance_metrics("api", "i3", ScalingMetrics::default().with_active_connections(2))
            .unwrap();
        assert_eq!(pick(&balancer, None), "i2");
    }

    #[test]
    fn test_weighted_frequencies_follow_weights() {
        let (balancer, _) = balancer(RoutingAlgorithm::Weighted);
        for _ in 0..10_000 {
            pick(&balancer, None);
        }
        let distribution = balancer.status("api").distribution;
        let ratio_1 = distribution["i2"] as f64 / distribution["i1"] as f64;
        let ratio_3 = distribution["i2"] as f64 / distribution["i3"] as f64;
        assert!((1.7..2.3).contains(&ratio_1), "i2/i1 = {ratio_1}");
        assert!((1.7..2.3).contains(&ratio_3), "i2/i3 = {ratio_3}");
    }

    #[test]
    fn test_ip_hash_is_stable() {
        let (balancer, _) = balancer(RoutingAlgorithm::IpHash);
        let first = pick(&balancer, Some("203.0.113.9"));
        for _ in 0..20 {
            assert_eq!(pick(&balancer, Some("203.0.113.9")), first);
        }
        assert_eq!(fnv1a_64(""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a_64("a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_unhealthy_instances_are_skipped() {
        let (balancer, store) = balancer(RoutingAlgorithm::RoundRobin);
        balancer.record_health_check("api", "i2", Some(false));
        let order: Vec<String> = (0..4).map(|_| pick(&balancer, None)).collect();
        assert!(!order.contains(&"i2".to_string()));

        balancer.record_health_check("api", "i1", Some(false));
        balancer.record_health_check("api", "i3", Some(false));
        assert!(balancer.select_instance("api", None).is_none());
        assert!(balancer.select_instance("unknown", None).is_none());
        assert_eq!(
            store
                .events_for_entity("api")
                .iter()
                .filter(|e| e.event_type == events::NO_HEALTHY_INSTANCES)
                .count(),
            1
        );
    }

    #[test]
    fn test_duplicate_registration_and_unregister() {
        let (balancer, _) = balancer(RoutingAlgorithm::RoundRobin);
        assert!(balancer
            .register_instance("api", ServiceInstance::new("i1", "10.0.0.2", 8080))
            .is_err());
        balancer.unregister_instance("api", "i2").unwrap();
        assert_eq!(balancer.instances("api").len(), 2);
        assert!(balancer.unregister_instance("api", "i2").is_err());
    }
}
