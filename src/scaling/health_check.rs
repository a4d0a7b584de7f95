//! # Health Checking
//!
//! Periodic probing of every registered instance. A single failed probe is
//! absorbed; an instance only leaves routing after `unhealthy_threshold`
//! consecutive failures and only returns after `healthy_threshold`
//! consecutive successes. Transitions update the [`LoadBalancer`] at once and
//! are recorded as events.

use super::load_balancer::LoadBalancer;
use super::types::{ProbeMethod, ServiceInstance};
use crate::config::HealthCheckSettings;
use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::EventStore;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Instance metadata key overriding the HTTP health path
pub const HEALTH_PATH_METADATA: &str = "health_path";
/// Instance metadata key overriding the health command
pub const HEALTH_COMMAND_METADATA: &str = "health_command";

/// Performs one health probe against an instance
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    async fn probe(&self, instance: &ServiceInstance, method: ProbeMethod) -> Result<()>;
}

/// Probes over the network or by running a local command
#[derive(Debug, Clone)]
pub struct NetworkHealthProbe {
    client: reqwest::Client,
    http_path: String,
    rpc_path: String,
    command: Vec<String>,
}

impl NetworkHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            http_path: "/health".to_string(),
            rpc_path: "/rpc".to_string(),
            command: Vec::new(),
        })
    }

    pub fn with_http_path(mut self, path: impl Into<String>) -> Self {
        self.http_path = path.into();
        self
    }

    pub fn with_rpc_path(mut self, path: impl Into<String>) -> Self {
        self.rpc_path = path.into();
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    fn failure(instance: &ServiceInstance, message: impl Into<String>) -> OrchestratorError {
        OrchestratorError::HealthCheck {
            instance_id: instance.id.clone(),
            message: message.into(),
        }
    }

    async fn probe_http(&self, instance: &ServiceInstance) -> Result<()> {
        let path = instance
            .metadata
            .get(HEALTH_PATH_METADATA)
            .unwrap_or(&self.http_path);
        let url = format!("http://{}{path}", instance.address());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::failure(instance, format!("GET {url}: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::failure(
                instance,
                format!("GET {url} returned {}", response.status()),
            ))
        }
    }

    async fn probe_tcp(&self, instance: &ServiceInstance) -> Result<()> {
        tokio::net::TcpStream::connect(instance.address())
            .await
            .map(|_| ())
            .map_err(|e| Self::failure(instance, format!("connect {}: {e}", instance.address())))
    }

    async fn probe_command(&self, instance: &ServiceInstance) -> Result<()> {
        let argv: Vec<String> = match instance.metadata.get(HEALTH_COMMAND_METADATA) {
            Some(command) => command.split_whitespace().map(str::to_string).collect(),
            None => self.command.clone(),
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(Self::failure(instance, "no health command configured"));
        };

        let status = tokio::process::Command::new(program)
            .args(args)
            .env("INSTANCE_ID", &instance.id)
            .env("INSTANCE_HOST", &instance.host)
            .env("INSTANCE_PORT", instance.port.to_string())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Self::failure(instance, format!("{program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(Self::failure(instance, format!("{program} exited with {status}")))
        }
    }

    async fn probe_rpc(&self, instance: &ServiceInstance) -> Result<()> {
        let url = format!("http://{}{}", instance.address(), self.rpc_path);
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "health" });
        let response: serde_json::Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Self::failure(instance, format!("POST {url}: {e}")))?
            .json()
            .await
            .map_err(|e| Self::failure(instance, format!("invalid health response: {e}")))?;

        let status = response
            .pointer("/result/status")
            .or_else(|| response.get("status"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if matches!(status.as_str(), "ok" | "healthy" | "serving") {
            Ok(())
        } else {
            Err(Self::failure(instance, format!("health call reported '{status}'")))
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkHealthProbe {
    async fn probe(&self, instance: &ServiceInstance, method: ProbeMethod) -> Result<()> {
        match method {
            ProbeMethod::Http => self.probe_http(instance).await,
            ProbeMethod::Tcp => self.probe_tcp(instance).await,
            ProbeMethod::Command => self.probe_command(instance).await,
            ProbeMethod::Rpc => self.probe_rpc(instance).await,
        }
    }
}

/// Consecutive outcome counters for one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub last_error: Option<String>,
}

/// An instance changed routing eligibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub component_id: String,
    pub instance_id: String,
    pub healthy: bool,
    pub consecutive: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCycleReport {
    pub probed: usize,
    pub failures: usize,
    pub transitions: Vec<HealthTransition>,
}

#[derive(Debug)]
pub struct HealthCheckManager {
    balancer: Arc<LoadBalancer>,
    probe: Arc<dyn HealthProbe>,
    defaults: HealthCheckSettings,
    overrides: DashMap<String, HealthCheckSettings>,
    records: DashMap<(String, String), ProbeRecord>,
    events: EventStore,
}

impl HealthCheckManager {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        probe: Arc<dyn HealthProbe>,
        defaults: HealthCheckSettings,
        events: EventStore,
    ) -> Self {
        Self {
            balancer,
            probe,
            defaults,
            overrides: DashMap::new(),
            records: DashMap::new(),
            events,
        }
    }

    pub fn set_component_settings(&self, component_id: &str, settings: HealthCheckSettings) {
        self.overrides.insert(component_id.to_string(), settings);
    }

    pub fn settings_for(&self, component_id: &str) -> HealthCheckSettings {
        self.overrides
            .get(component_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn probe_record(&self, component_id: &str, instance_id: &str) -> Option<ProbeRecord> {
        self.records
            .get(&(component_id.to_string(), instance_id.to_string()))
            .map(|r| r.clone())
    }

    /// Drop the probe counters of an instance that left the pool
    pub fn forget(&self, component_id: &str, instance_id: &str) -> Option<ProbeRecord> {
        self.records
            .remove(&(component_id.to_string(), instance_id.to_string()))
            .map(|(_, record)| record)
    }

    /// Apply one probe outcome, flipping eligibility once a threshold is reached
    pub fn record_result(
        &self,
        component_id: &str,
        instance_id: &str,
        outcome: std::result::Result<(), String>,
    ) -> Option<HealthTransition> {
        let settings = self.settings_for(component_id);
        let (desired, consecutive, last_error) = {
            let mut record = self
                .records
                .entry((component_id.to_string(), instance_id.to_string()))
                .or_default();
            record.total_probes += 1;
            match outcome {
                Ok(()) => {
                    record.consecutive_successes += 1;
                    record.consecutive_failures = 0;
                    record.last_error = None;
                }
                Err(message) => {
                    record.consecutive_failures += 1;
                    record.consecutive_successes = 0;
                    record.last_error = Some(message);
                }
            }

            if record.consecutive_failures >= settings.unhealthy_threshold.max(1) {
                (Some(false), record.consecutive_failures, record.last_error.clone())
            } else if record.consecutive_successes >= settings.healthy_threshold.max(1) {
                (Some(true), record.consecutive_successes, None)
            } else {
                (None, 0, record.last_error.clone())
            }
        };

        let previous = self
            .balancer
            .record_health_check(component_id, instance_id, desired)?;
        let healthy = desired?;
        if previous == healthy {
            return None;
        }

        if healthy {
            info!(
                component_id = %component_id,
                instance_id = %instance_id,
                consecutive_successes = consecutive,
                "💚 Instance healthy; routing resumed"
            );
        } else {
            warn!(
                component_id = %component_id,
                instance_id = %instance_id,
                consecutive_failures = consecutive,
                last_error = ?last_error,
                "💔 Instance unhealthy; removed from routing"
            );
        }
        self.events.append(
            if healthy {
                events::INSTANCE_HEALTHY
            } else {
                events::INSTANCE_UNHEALTHY
            },
            Some(instance_id),
            json!({
                "component_id": component_id,
                "consecutive": consecutive,
                "last_error": last_error,
            }),
        );

        Some(HealthTransition {
            component_id: component_id.to_string(),
            instance_id: instance_id.to_string(),
            healthy,
            consecutive,
        })
    }

    /// Probe one instance under its component's timeout
    pub async fn check_instance(
        &self,
        component_id: &str,
        instance: &ServiceInstance,
    ) -> (bool, Option<HealthTransition>) {
        let settings = self.settings_for(component_id);
        let outcome = match tokio::time::timeout(
            settings.timeout(),
            self.probe.probe(instance, settings.method),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {}ms", settings.timeout_ms)),
        };
        if let Err(message) = &outcome {
            debug!(
                component_id = %component_id,
                instance_id = %instance.id,
                error = %message,
                "Health probe failed"
            );
        }
        let passed = outcome.is_ok();
        (passed, self.record_result(component_id, &instance.id, outcome))
    }

    /// Probe every registered instance concurrently
    pub async fn run_cycle(&self) -> HealthCycleReport {
        let instances = self.balancer.all_instances();
        let outcomes = join_all(
            instances
                .iter()
                .map(|(component_id, instance)| self.check_instance(component_id, instance)),
        )
        .await;

        let mut report = HealthCycleReport {
            probed: outcomes.len(),
            ..HealthCycleReport::default()
        };
        for (passed, transition) in outcomes {
            if !passed {
                report.failures += 1;
            }
            report.transitions.extend(transition);
        }
        report
    }

    /// Run health cycles on the configured interval until `shutdown` flips
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = this.defaults.interval_ms, "🩺 Health check loop started");
            let mut ticker = interval(this.defaults.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = this.run_cycle().await;
                        debug!(
                            probed = report.probed,
                            failures = report.failures,
                            transitions = report.transitions.len(),
                            "Health cycle finished"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health check loop shutting down");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancerSettings;
    use crate::scaling::types::RoutingAlgorithm;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct ScriptedProbe {
        failing: Mutex<HashSet<String>>,
        hanging: Mutex<HashSet<String>>,
    }

    impl ScriptedProbe {
        fn fail(&self, instance_id: &str, failing: bool) {
            let mut set = self.failing.lock();
            if failing {
                set.insert(instance_id.to_string());
            } else {
                set.remove(instance_id);
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, instance: &ServiceInstance, _method: ProbeMethod) -> Result<()> {
            if self.hanging.lock().contains(&instance.id) {
                std::future::pending::<()>().await;
            }
            if self.failing.lock().contains(&instance.id) {
                return Err(OrchestratorError::HealthCheck {
                    instance_id: instance.id.clone(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<HealthCheckManager>, Arc<LoadBalancer>, Arc<ScriptedProbe>, EventStore) {
        let store = EventStore::default();
        let balancer = Arc::new(LoadBalancer::new(
            LoadBalancerSettings::default(),
            store.clone(),
        ));
        for id in ["i1", "i2", "i3"] {
            balancer
                .register_instance("api", ServiceInstance::new(id, "10.0.0.1", 8080))
                .unwrap();
        }
        let probe = Arc::new(ScriptedProbe::default());
        let manager = Arc::new(HealthCheckManager::new(
            Arc::clone(&balancer),
            Arc::clone(&probe) as Arc<dyn HealthProbe>,
            HealthCheckSettings {
                healthy_threshold: 2,
                unhealthy_threshold: 3,
                ..HealthCheckSettings::default()
            },
            store.clone(),
        ));
        (manager, balancer, probe, store)
    }

    fn routable_everywhere(balancer: &LoadBalancer, instance_id: &str) -> bool {
        [
            RoutingAlgorithm::RoundRobin,
            RoutingAlgorithm::LeastConnections,
            RoutingAlgorithm::Weighted,
            RoutingAlgorithm::IpHash,
        ]
        .into_iter()
        .any(|algorithm| {
            balancer.set_algorithm("api", algorithm);
            (0..30).any(|n| {
                let key = format!("client-{n}");
                balancer
                    .select_instance("api", Some(&key))
                    .is_some_and(|i| i.id == instance_id)
            })
        })
    }

    #[tokio::test]
    async fn test_thresholds_gate_routing_eligibility() {
        let (manager, balancer, probe, store) = setup();
        probe.fail("i2", true);

        manager.run_cycle().await;
        manager.run_cycle().await;
        assert!(balancer.healthy_instances("api").iter().any(|i| i.id == "i2"));

        let report = manager.run_cycle().await;
        assert_eq!(report.transitions.len(), 1);
        assert!(!report.transitions[0].healthy);
        assert!(!routable_everywhere(&balancer, "i2"));

        probe.fail("i2", false);
        manager.run_cycle().await;
        assert!(!routable_everywhere(&balancer, "i2"));
        let report = manager.run_cycle().await;
        assert!(report.transitions[0].healthy);
        assert!(routable_everywhere(&balancer, "i2"));

        let kinds: Vec<String> = store
            .events_for_entity("i2")
            .into_iter()
            .map(|e| e.event_type)
            .filter(|t| t.starts_with("instance.") && t != events::INSTANCE_REGISTERED)
            .collect();
        assert_eq!(kinds, vec![events::INSTANCE_UNHEALTHY, events::INSTANCE_HEALTHY]);
    }

    #[tokio::test]
    async fn test_single_failure_is_absorbed() {
        let (manager, balancer, probe, _) = setup();
        probe.fail("i1", true);
        manager.run_cycle().await;
        probe.fail("i1", false);
        manager.run_cycle().await;
        probe.fail("i1", true);
        manager.run_cycle().await;
        manager.run_cycle().await;

        assert_eq!(balancer.healthy_instances("api").len(), 3);
        assert_eq!(
            manager.probe_record("api", "i1").unwrap().consecutive_failures,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_counts_as_failure() {
        let (manager, _, probe, _) = setup();
        probe.hanging.lock().insert("i3".to_string());
        let report = manager.run_cycle().await;
        assert_eq!(report.probed, 3);
        assert_eq!(report.failures, 1);
        let record = manager.probe_record("api", "i3").unwrap();
        assert!(record.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = NetworkHealthProbe::new(Duration::from_secs(2)).unwrap();

        let up = ServiceInstance::new("up", "127.0.0.1", port);
        assert!(probe.probe(&up, ProbeMethod::Tcp).await.is_ok());

        drop(listener);
        let down = ServiceInstance::new("down", "127.0.0.1", port);
        assert!(probe.probe(&down, ProbeMethod::Tcp).await.is_err());
    }

    #[tokio::test]
    async fn test_command_probe_uses_exit_status() {
        let probe = NetworkHealthProbe::new(Duration::from_secs(2)).unwrap();
        let ok = ServiceInstance::new("ok", "127.0.0.1", 1).with_metadata(HEALTH_COMMAND_METADATA, "true");
        let failing =
            ServiceInstance::new("bad", "127.0.0.1", 1).with_metadata(HEALTH_COMMAND_METADATA, "false");
        let missing = ServiceInstance::new("none", "127.0.0.1", 1);

        assert!(probe.probe(&ok, ProbeMethod::Command).await.is_ok());
        assert!(probe.probe(&failing, ProbeMethod::Command).await.is_err());
        assert!(probe.probe(&missing, ProbeMethod::Command).await.is_err());
    }
}
