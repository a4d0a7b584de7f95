//! # Circuit Breaker Implementation
//!
//! Fault isolation for downstream dependencies. Three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (exactly one
//! probe call admitted to test recovery).
//!
//! The state byte is atomic for lock-free reads; every transition happens while
//! holding the inner mutex so counters and state never disagree.

use super::config::CircuitBreakerSettings;
use super::metrics::CircuitBreakerMetrics;
use crate::constants::events;
use crate::events::EventStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - a single probe call is allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Unknown values map to the safest state
            _ => CircuitState::Open,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not attempted
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation was attempted, failed, and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Externally visible breaker state for one dependency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Core circuit breaker implementation with atomic state management
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    events: Option<EventStore>,
}

/// Admission to call the protected dependency
///
/// Dropping a probe permit without reporting an outcome frees the half-open
/// slot so a cancelled call cannot wedge the breaker.
#[derive(Debug)]
#[must_use = "report the outcome with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self, duration: Duration) {
        self.reported = true;
        self.breaker.record_success(duration);
    }

    pub fn failure(mut self, duration: Duration) {
        self.reported = true;
        self.breaker.record_failure(duration);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.reported {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerSettings) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.timeout.as_secs(),
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                metrics: CircuitBreakerMetrics::new(),
                opened_at: None,
                opened_at_utc: None,
                probe_in_flight: false,
            }),
            events: None,
        }
    }

    /// Create a breaker that records its transitions in the event store
    pub fn with_events(name: String, config: CircuitBreakerSettings, events: EventStore) -> Self {
        let mut breaker = Self::new(name, config);
        breaker.events = Some(events);
        breaker
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerSettings {
        &self.config
    }

    /// Ask to call the dependency; `None` means short-circuit
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        match self.state() {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition_to_half_open(&mut inner);
                    inner.probe_in_flight = true;
                    Some(self.permit(true))
                } else {
                    inner.metrics.rejected_calls += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.metrics.rejected_calls += 1;
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(self.permit(true))
                }
            }
        }
    }

    fn permit(&self, probe: bool) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            probe,
            reported: false,
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            debug!(component = %self.name, "⛔ Call short-circuited");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        };

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => permit.success(duration),
            Err(_) => permit.failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Record a successful call outcome
    pub fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match self.state() {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.metrics.half_open_successes += 1;
                if inner.metrics.half_open_successes >= u64::from(self.config.success_threshold) {
                    self.transition_to_closed(&mut inner);
                }
            }
            CircuitState::Closed => {
                inner.metrics.consecutive_failures = 0;
            }
            CircuitState::Open => {
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match self.state() {
            CircuitState::Closed => {
                inner.metrics.consecutive_failures += 1;
                if inner.metrics.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe reopens immediately
                inner.probe_in_flight = false;
                inner.metrics.consecutive_failures += 1;
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        inner.metrics.consecutive_failures = 0;
        inner.metrics.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
        inner.opened_at_utc = None;

        info!(
            component = %self.name,
            total_calls = inner.metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
        self.emit(events::CIRCUIT_BREAKER_CLOSED, inner);
    }

    fn transition_to_open(&self, inner: &mut BreakerInner) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
        inner.metrics.half_open_successes = 0;

        error!(
            component = %self.name,
            consecutive_failures = inner.metrics.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            timeout_seconds = self.config.timeout.as_secs(),
            "🔴 Circuit breaker opened (failing fast)"
        );
        self.emit(events::CIRCUIT_BREAKER_OPENED, inner);
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        inner.metrics.half_open_successes = 0;

        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
        self.emit(events::CIRCUIT_BREAKER_HALF_OPEN, inner);
    }

    fn emit(&self, event_type: &str, inner: &BreakerInner) {
        if let Some(store) = &self.events {
            store.append(
                event_type,
                Some(&self.name),
                json!({
                    "key": self.name,
                    "state": self.state().to_string(),
                    "consecutive_failures": inner.metrics.consecutive_failures,
                    "timeout_ms": self.config.timeout.as_millis() as u64,
                }),
            );
        }
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition_to_open(&mut inner);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition_to_closed(&mut inner);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        inner.metrics.clone().with_derived(self.state())
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            key: self.name.clone(),
            state: self.state(),
            consecutive_failures: inner.metrics.consecutive_failures,
            opened_at: inner.opened_at_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn settings(failure_threshold: u32, timeout: Duration) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold,
            timeout,
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test".to_string(), settings(3, Duration::from_secs(1)));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_then_single_probe_closes() {
        let store = EventStore::default();
        let circuit = CircuitBreaker::with_events(
            "registry".to_string(),
            settings(3, Duration::from_secs(60)),
            store.clone(),
        );
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = invocations.clone();
            let _ = circuit
                .call(|| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                })
                .await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        // Immediately after opening the dependency is not invoked
        let counter = invocations.clone();
        let result = circuit
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(61)).await;

        // Exactly one probe is admitted
        let probe = circuit.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(circuit.try_acquire().is_none());

        probe.success(Duration::from_millis(5));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let transitions: Vec<String> = store
            .events_for_entity("registry")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            transitions,
            vec![
                events::CIRCUIT_BREAKER_OPENED,
                events::CIRCUIT_BREAKER_HALF_OPEN,
                events::CIRCUIT_BREAKER_CLOSED
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let circuit = CircuitBreaker::new("test".to_string(), settings(1, Duration::from_secs(10)));
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = circuit.call(|| async { Err::<(), _>("still failing") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // Cooldown restarts from the failed probe
        assert!(circuit.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let circuit = CircuitBreaker::new("test".to_string(), settings(1, Duration::from_secs(1)));
        circuit.record_failure(Duration::ZERO);
        tokio::time::advance(Duration::from_secs(2)).await;

        let probe = circuit.try_acquire().unwrap();
        drop(probe);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(circuit.try_acquire().is_some());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new("test".to_string(), settings(3, Duration::from_secs(1)));
        circuit.record_failure(Duration::ZERO);
        circuit.record_failure(Duration::ZERO);
        circuit.record_success(Duration::ZERO);
        circuit.record_failure(Duration::ZERO);

        let snapshot = circuit.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(snapshot.opened_at.is_none());
    }

    #[test]
    fn test_force_transitions() {
        let circuit = CircuitBreaker::new("test".to_string(), settings(3, Duration::from_secs(1)));
        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(circuit.snapshot().opened_at.is_some());
        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
