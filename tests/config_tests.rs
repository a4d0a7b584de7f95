use orchestrator_core::config::{ConfigManager, BASE_CONFIG_FILE};
use orchestrator_core::event_types as events;
use orchestrator_core::events::IncomingEvent;
use orchestrator_core::orchestration::WorkPriority;
use orchestrator_core::resilience::CircuitState;
use orchestrator_core::scaling::{MetricKind, RoutingAlgorithm};
use orchestrator_core::OrchestrationCore;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

fn shipped_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn shipped_configuration_is_valid_for_every_environment() {
    for environment in ["development", "test", "production"] {
        let manager =
            ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), environment)
                .unwrap_or_else(|e| panic!("{environment}: {e}"));
        assert_eq!(manager.config().environment, environment);
    }

    let production =
        ConfigManager::load_from_directory_with_env(Some(shipped_config_dir()), "production")
            .unwrap();
    let config = production.config();
    assert_eq!(config.queue.max_queue_depth, 5000);
    assert_eq!(config.queue.shed_below_priority, WorkPriority::High);
    assert_eq!(config.backoff.max_attempts, 5);
    assert_eq!(config.backoff.base_delay_ms, 100);
    assert_eq!(
        config.load_balancer.default_algorithm,
        RoutingAlgorithm::LeastConnections
    );
    assert_eq!(config.scaling.policies.len(), 1);
    assert_eq!(config.scaling.policies[0].target_metric, MetricKind::Cpu);
    assert_eq!(
        config
            .circuit_breakers
            .config_for_component("artifact-store")
            .failure_threshold,
        3
    );
}

#[tokio::test]
async fn core_boots_from_layered_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join(BASE_CONFIG_FILE),
        r#"
circuit_breakers:
  default_config:
    failure_threshold: 4
    timeout_seconds: 60
  component_configs:
    registry:
      failure_threshold: 1
      timeout_seconds: 60
scaling:
  policies:
    - id: web-mem
      component_id: web
      target_metric: memory
      scale_up_threshold: 80.0
      scale_down_threshold: 20.0
      min_instances: 1
      max_instances: 4
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("orchestrator.qa.yaml"),
        "queue:\n  max_queue_depth: 7\n",
    )
    .unwrap();

    let manager =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "qa").unwrap();
    let core = OrchestrationCore::from_config(manager).unwrap();

    assert_eq!(core.get_queue_status().max_queue_depth, 7);
    let status = core.get_scaling_status("web").unwrap();
    assert_eq!(status.scaling.max_instances, Some(4));
    assert_eq!(status.scaling.policies[0].cooldown_period_seconds, 300);

    // the per-dependency override opens after a single failure
    core.handle_event(IncomingEvent::new(
        events::COMPONENT_FAILURE,
        json!({ "dependency": "registry" }),
    ));
    assert_eq!(
        core.get_circuit_breaker_status()["registry"].state,
        CircuitState::Open
    );
}

#[test]
fn invalid_override_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(BASE_CONFIG_FILE), "queue:\n  max_queue_depth: 10\n").unwrap();
    fs::write(
        dir.path().join("orchestrator.broken.yaml"),
        "backoff:\n  base_delay_ms: 5000\n  max_delay_ms: 100\n",
    )
    .unwrap();

    let result =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "broken");
    assert!(result.is_err());
}
