//! # Scaling
//!
//! Metrics-driven right-sizing and traffic routing. [`ScalingManager`] is the
//! entry point; it owns the [`AutoScaler`], the [`LoadBalancer`] and the
//! [`HealthCheckManager`] and runs evaluation and probing on independent ticks.

pub mod auto_scaler;
pub mod health_check;
pub mod load_balancer;
pub mod metrics_window;
pub mod scaling_manager;
pub mod types;

pub use auto_scaler::{
    AutoScaler, Bottleneck, BottleneckSeverity, CostRecommendation, ScalingDecision,
    ScalingDirection,
};
pub use health_check::{
    HealthCheckManager, HealthCycleReport, HealthProbe, HealthTransition, NetworkHealthProbe,
    ProbeRecord,
};
pub use load_balancer::{LoadBalancer, LoadBalancingStatus};
pub use metrics_window::MetricsWindow;
pub use scaling_manager::{
    ComponentHealth, ComponentScalingStatus, HealthLevel, NoopScalingExecutor, ScalingEvent,
    ScalingExecutor, ScalingManager, ScalingResult, ScalingTrigger, SystemHealth,
};
pub use types::{
    MetricKind, ProbeMethod, RoutingAlgorithm, ScalingMetrics, ScalingPolicy, ServiceInstance,
};
