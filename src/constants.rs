//! # System Constants
//!
//! Event names and operational defaults shared across the orchestration core.

/// Event type names appended to the event store
pub mod events {
    // Work request lifecycle
    pub const WORK_QUEUED: &str = "work.queued";
    pub const WORK_STARTED: &str = "work.started";
    pub const WORK_COMPLETED: &str = "work.completed";
    pub const WORK_FAILED: &str = "work.failed";
    pub const WORK_RETRY_SCHEDULED: &str = "work.retry_scheduled";

    // Dependency and system health
    pub const COMPONENT_FAILURE: &str = "component.failure";
    pub const COMPONENT_RECOVERED: &str = "component.recovered";
    pub const SYSTEM_OVERLOAD: &str = "system.overload";

    // Circuit breaker transitions
    pub const CIRCUIT_BREAKER_OPENED: &str = "circuit_breaker.opened";
    pub const CIRCUIT_BREAKER_HALF_OPEN: &str = "circuit_breaker.half_open";
    pub const CIRCUIT_BREAKER_CLOSED: &str = "circuit_breaker.closed";

    // Deployment lifecycle
    pub const DEPLOYMENT_CREATED: &str = "deployment.created";
    pub const DEPLOYMENT_STATUS_CHANGED: &str = "deployment.status_changed";
    pub const DEPLOYMENT_VALIDATION_COMPLETED: &str = "deployment.validation_completed";
    pub const DEPLOYMENT_STAGE_COMPLETED: &str = "deployment.stage_completed";
    pub const DEPLOYMENT_TRAFFIC_SHIFTED: &str = "deployment.traffic_shifted";
    pub const DEPLOYMENT_COMPLETED: &str = "deployment.completed";
    pub const DEPLOYMENT_FAILED: &str = "deployment.failed";
    pub const DEPLOYMENT_PAUSED: &str = "deployment.paused";
    pub const DEPLOYMENT_RESUMED: &str = "deployment.resumed";
    pub const DEPLOYMENT_ROLLED_BACK: &str = "deployment.rolled_back";
    pub const DEPLOYMENT_ROLLBACK_FAILED: &str = "deployment.rollback_failed";
    pub const DEPLOYMENT_PROMOTED: &str = "deployment.promoted";

    // Approvals
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_DECIDED: &str = "approval.decided";
    pub const APPROVAL_EXPIRED: &str = "approval.expired";

    // Scaling and routing
    pub const SCALING_SCALED_UP: &str = "scaling.scaled_up";
    pub const SCALING_SCALED_DOWN: &str = "scaling.scaled_down";
    pub const SCALING_MANUAL: &str = "scaling.manual";
    pub const SCALING_FAILED: &str = "scaling.failed";
    pub const SCALING_BOTTLENECK_DETECTED: &str = "scaling.bottleneck_detected";
    pub const SCALING_POLICY_UPDATED: &str = "scaling.policy_updated";
    pub const INSTANCE_REGISTERED: &str = "instance.registered";
    pub const INSTANCE_UNREGISTERED: &str = "instance.unregistered";
    pub const INSTANCE_HEALTHY: &str = "instance.healthy";
    pub const INSTANCE_UNHEALTHY: &str = "instance.unhealthy";
    pub const NO_HEALTHY_INSTANCES: &str = "load_balancer.no_healthy_instances";
}

/// Operational limits and defaults
pub mod system {
    /// Upper bound on deployment log entries kept per record
    pub const MAX_DEPLOYMENT_LOG_ENTRIES: usize = 1_000;

    /// Upper bound on scaling history entries kept per component
    pub const MAX_SCALING_HISTORY: usize = 200;

    /// Hours used to project hourly instance cost to a monthly figure
    pub const HOURS_PER_MONTH: f64 = 730.0;

    /// Default capacity of the event broadcast channel
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1_024;
}
