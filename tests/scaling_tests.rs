mod common;

use common::{core_with, ScriptedProbe};
use orchestrator_core::config::HealthCheckSettings;
use orchestrator_core::deployment::InMemoryTarget;
use orchestrator_core::event_types as events;
use orchestrator_core::scaling::{
    HealthLevel, MetricKind, RoutingAlgorithm, ScalingMetrics, ScalingPolicy, ServiceInstance,
};
use orchestrator_core::{EventFilter, OrchestrationCore, OrchestratorConfig};
use std::sync::Arc;
use std::time::Duration;

fn core(config: OrchestratorConfig) -> (OrchestrationCore, Arc<ScriptedProbe>) {
    let probe = Arc::new(ScriptedProbe::default());
    let core = core_with(config, Arc::new(InMemoryTarget::new()), Arc::clone(&probe));
    (core, probe)
}

fn cpu_policy() -> ScalingPolicy {
    ScalingPolicy::new("checkout-cpu", "checkout", MetricKind::Cpu, 70.0, 30.0)
        .with_bounds(2, 10)
        .with_steps(2, 1)
        .with_cooldown(Duration::ZERO)
}

#[tokio::test]
async fn sustained_load_scales_in_steps_up_to_max() {
    let mut config = OrchestratorConfig::default();
    config.scaling.policies = vec![cpu_policy()];
    let (core, _) = core(config);

    assert!(core.manual_scale("checkout", 4, "baseline").await.success);
    core.add_metrics("checkout", ScalingMetrics::default().with_cpu(85.0))
        .unwrap();

    let mut counts = Vec::new();
    for _ in 0..4 {
        core.scaling().evaluate().await;
        counts.push(core.get_scaling_status("checkout").unwrap().scaling.current_instances);
    }
    assert_eq!(counts, vec![6, 8, 10, 10]);

    let status = core.get_scaling_status("checkout").unwrap();
    assert_eq!(status.scaling.max_instances, Some(10));
    // manual baseline plus three policy actions
    assert_eq!(status.scaling.history.len(), 4);
    assert_eq!(
        core.query_events(&EventFilter::all().with_type(events::SCALING_SCALED_UP))
            .len(),
        3
    );
}

#[tokio::test]
async fn manual_scale_outside_policy_bounds_is_rejected() {
    let mut config = OrchestratorConfig::default();
    config.scaling.policies = vec![cpu_policy()];
    let (core, _) = core(config);

    let result = core.manual_scale("checkout", 1, "too small").await;
    assert!(!result.success);
    assert_eq!(
        result.category,
        Some(orchestrator_core::ErrorCategory::Validation)
    );
    assert_eq!(
        core.query_events(&EventFilter::all().with_type(events::SCALING_FAILED))
            .len(),
        1
    );
}

#[tokio::test]
async fn routing_without_healthy_instances_returns_none_with_event() {
    let (core, _) = core(OrchestratorConfig::default());
    let scaling = core.scaling();

    assert!(scaling.route("search", Some("203.0.113.9")).is_none());

    scaling
        .register_instance("search", ServiceInstance::new("s1", "10.0.0.1", 8080))
        .unwrap();
    let balancer = scaling.load_balancer();
    balancer.set_algorithm("search", RoutingAlgorithm::IpHash);
    let health = scaling.health_checks();
    for _ in 0..health.settings_for("search").unhealthy_threshold {
        health.record_result("search", "s1", Err("connection refused".to_string()));
    }

    assert!(scaling.route("search", Some("203.0.113.9")).is_none());
    let misses = core.query_events(
        &EventFilter::all()
            .with_type(events::NO_HEALTHY_INSTANCES)
            .with_entity("search"),
    );
    assert_eq!(misses.len(), 2);
}

#[tokio::test]
async fn probe_thresholds_gate_routing() {
    let mut config = OrchestratorConfig::default();
    config.health_checks = HealthCheckSettings {
        unhealthy_threshold: 3,
        healthy_threshold: 2,
        ..HealthCheckSettings::default()
    };
    let (core, probe) = core(config);
    let scaling = core.scaling();
    for (id, port) in [("a", 9001), ("b", 9002)] {
        scaling
            .register_instance("api", ServiceInstance::new(id, "127.0.0.1", port))
            .unwrap();
    }
    let health = scaling.health_checks();

    probe.set_failing("a", true);
    for _ in 0..2 {
        health.run_cycle().await;
    }
    // two misses are absorbed
    assert_eq!(scaling.load_balancer().healthy_instances("api").len(), 2);

    let report = health.run_cycle().await;
    assert_eq!(report.transitions.len(), 1);
    assert!(!report.transitions[0].healthy);
    for _ in 0..6 {
        assert_eq!(scaling.route("api", None).unwrap().id, "b");
    }

    probe.set_failing("a", false);
    health.run_cycle().await;
    assert_eq!(scaling.load_balancer().healthy_instances("api").len(), 1);
    health.run_cycle().await;
    assert_eq!(scaling.load_balancer().healthy_instances("api").len(), 2);

    let transitions: Vec<String> = core
        .query_events(&EventFilter::all().with_entity("a"))
        .into_iter()
        .map(|e| e.event_type)
        .filter(|t| t.starts_with("instance.") && t != events::INSTANCE_REGISTERED)
        .collect();
    assert_eq!(
        transitions,
        vec![events::INSTANCE_UNHEALTHY, events::INSTANCE_HEALTHY]
    );
}

#[tokio::test]
async fn critical_bottleneck_surfaces_in_system_health() {
    let (core, _) = core(OrchestratorConfig::default());
    core.add_metrics("ledger", ScalingMetrics::default().with_cpu(92.0))
        .unwrap();
    core.scaling().evaluate().await;

    let health = core.get_system_health();
    assert_eq!(health.overall, HealthLevel::Critical);
    assert_eq!(health.critical_bottlenecks, 1);
    assert_eq!(
        core.query_events(&EventFilter::all().with_type(events::SCALING_BOTTLENECK_DETECTED))
            .len(),
        1
    );
}
