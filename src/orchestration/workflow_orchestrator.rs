//! # Workflow Orchestrator
//!
//! Accepts work requests into a tiered priority queue and executes them through
//! registered [`WorkHandler`]s with retry, backoff and per-dependency circuit
//! breaking.
//!
//! ## Processing model
//!
//! - `submit` sheds lower priorities once the queue is saturated
//! - `process_next` executes the head of the queue inline (one tick)
//! - `start` runs a background loop on its own interval, bounded by
//!   `max_concurrent_requests`, that yields between dequeues
//! - pending retry waits are cancelled by `shutdown`

use super::backoff_calculator::BackoffCalculator;
use super::handlers::{HandlerRegistry, WorkHandler};
use super::priority_queue::PriorityQueue;
use super::types::{QueueStatus, WorkKind, WorkMetrics, WorkRequest, WorkResult, WorkTicket};
use crate::config::{BackoffConfig, QueueConfig};
use crate::constants::events;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventStore, IncomingEvent, SystemEvent};
use crate::logging::log_work_operation;
use crate::resilience::CircuitBreakerManager;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work waiting in the queue together with its result channel
#[derive(Debug)]
struct QueuedWork {
    request: WorkRequest,
    trace_id: String,
    enqueued_at: Instant,
    responder: oneshot::Sender<WorkResult>,
}

/// Priority scheduler and executor for work requests
#[derive(Debug)]
pub struct WorkflowOrchestrator {
    config: QueueConfig,
    queue: Mutex<PriorityQueue<QueuedWork>>,
    processing: AtomicUsize,
    handlers: RwLock<HandlerRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    backoff: BackoffCalculator,
    events: EventStore,
    concurrency: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl WorkflowOrchestrator {
    pub fn new(
        config: QueueConfig,
        backoff: BackoffConfig,
        breakers: Arc<CircuitBreakerManager>,
        events: EventStore,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            config,
            queue: Mutex::new(PriorityQueue::new()),
            processing: AtomicUsize::new(0),
            handlers: RwLock::new(HandlerRegistry::default()),
            breakers,
            backoff: BackoffCalculator::new(backoff),
            events,
            shutdown,
        }
    }

    /// Install the handler for a work kind, replacing any previous one
    pub fn register_handler(&self, kind: WorkKind, handler: Arc<dyn WorkHandler>) {
        info!(kind = %kind, "Registered work handler");
        self.handlers.write().register(kind, handler);
    }

    /// Enqueue a request; low priorities are shed when the queue is saturated
    pub fn submit(&self, request: WorkRequest) -> Result<WorkTicket> {
        let mut queue = self.queue.lock();
        let depth = queue.len();

        if depth >= self.config.max_queue_depth
            && request.priority.is_below(self.config.shed_below_priority)
        {
            let error = OrchestratorError::Overload {
                queue_depth: depth,
                limit: self.config.max_queue_depth,
                priority: request.priority.to_string(),
            };
            self.events.append(
                events::SYSTEM_OVERLOAD,
                Some(&request.id),
                json!({
                    "request_id": request.id,
                    "priority": request.priority.to_string(),
                    "queue_depth": depth,
                    "limit": self.config.max_queue_depth,
                }),
            );
            warn!(
                request_id = %request.id,
                priority = %request.priority,
                queue_depth = depth,
                "🚦 Queue saturated, request shed"
            );
            return Err(error);
        }

        let trace_id = Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();
        let ticket = WorkTicket::new(
            request.id.clone(),
            trace_id.clone(),
            request.priority,
            receiver,
        );

        // Recorded under the queue lock so `work.queued` precedes `work.started`
        self.events.append(
            events::WORK_QUEUED,
            Some(&request.id),
            json!({
                "kind": request.kind.to_string(),
                "priority": request.priority.to_string(),
                "trace_id": trace_id,
                "queue_depth": depth + 1,
            }),
        );
        log_work_operation(
            "submit",
            &request.id,
            &request.kind.to_string(),
            &request.priority.to_string(),
            "queued",
            None,
        );

        queue.push(
            request.priority,
            QueuedWork {
                request,
                trace_id,
                enqueued_at: Instant::now(),
                responder,
            },
        );

        Ok(ticket)
    }

    fn dequeue(&self) -> Option<QueuedWork> {
        let mut queue = self.queue.lock();
        let (_, work) = queue.pop()?;
        self.processing.fetch_add(1, Ordering::SeqCst);
        Some(work)
    }

    /// Execute the head of the queue inline; `None` when the queue is empty
    pub async fn process_next(&self) -> Option<WorkResult> {
        let work = self.dequeue()?;
        Some(self.run(work).await)
    }

    /// Drain the queue one request at a time, returning results in execution order
    pub async fn process_all(&self) -> Vec<WorkResult> {
        let mut results = Vec::new();
        while let Some(result) = self.process_next().await {
            results.push(result);
        }
        results
    }

    async fn run(&self, work: QueuedWork) -> WorkResult {
        let QueuedWork {
            request,
            trace_id,
            enqueued_at,
            responder,
        } = work;

        let result = self.execute(&request, &trace_id, enqueued_at).await;
        self.processing.fetch_sub(1, Ordering::SeqCst);

        // The submitter may have dropped its ticket
        let _ = responder.send(result.clone());
        result
    }

    async fn execute(&self, request: &WorkRequest, trace_id: &str, enqueued_at: Instant) -> WorkResult {
        let queue_wait_ms = enqueued_at.elapsed().as_millis() as u64;
        let started = Instant::now();

        self.events.append(
            events::WORK_STARTED,
            Some(&request.id),
            json!({
                "kind": request.kind.to_string(),
                "priority": request.priority.to_string(),
                "trace_id": trace_id,
                "queue_wait_ms": queue_wait_ms,
            }),
        );

        let handler = self.handlers.read().get(request.kind);
        let (outcome, attempts) = match handler {
            Some(handler) => self.call_with_retry(handler.as_ref(), request).await,
            None => (
                Err(OrchestratorError::validation(format!(
                    "no handler registered for work kind '{}'",
                    request.kind
                ))),
                0,
            ),
        };

        let metrics = WorkMetrics {
            attempts,
            queue_wait_ms,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            Ok(data) => {
                self.events.append(
                    events::WORK_COMPLETED,
                    Some(&request.id),
                    json!({
                        "trace_id": trace_id,
                        "attempts": attempts,
                        "duration_ms": metrics.duration_ms,
                    }),
                );
                log_work_operation(
                    "execute",
                    &request.id,
                    &request.kind.to_string(),
                    &request.priority.to_string(),
                    "completed",
                    None,
                );
                WorkResult::success(&request.id, trace_id, data, metrics)
            }
            Err(error) => {
                self.events.append(
                    events::WORK_FAILED,
                    Some(&request.id),
                    json!({
                        "trace_id": trace_id,
                        "attempts": attempts,
                        "category": error.category(),
                        "error": error.to_string(),
                    }),
                );
                log_work_operation(
                    "execute",
                    &request.id,
                    &request.kind.to_string(),
                    &request.priority.to_string(),
                    "failed",
                    Some(&error.to_string()),
                );
                WorkResult::failure(&request.id, trace_id, &error, metrics)
            }
        }
    }

    /// Call the handler until success, a non-retryable error, or exhaustion
    async fn call_with_retry(
        &self,
        handler: &dyn WorkHandler,
        request: &WorkRequest,
    ) -> (Result<Value>, u32) {
        let dependency = handler.dependency_key(request);
        let breaker = self
            .breakers
            .is_enabled()
            .then(|| self.breakers.get_circuit_breaker(&dependency));
        let mut attempts = 0u32;

        loop {
            let permit = match &breaker {
                Some(breaker) => match breaker.try_acquire() {
                    Some(permit) => Some(permit),
                    None => {
                        debug!(
                            request_id = %request.id,
                            dependency = %dependency,
                            "⛔ Dependency circuit open, not attempted"
                        );
                        return (
                            Err(OrchestratorError::CircuitOpen {
                                dependency: dependency.clone(),
                            }),
                            attempts,
                        );
                    }
                },
                None => None,
            };

            attempts += 1;
            let call_started = Instant::now();
            let outcome = handler.handle(request).await;
            let elapsed = call_started.elapsed();

            let error = match outcome {
                Ok(data) => {
                    if let Some(permit) = permit {
                        permit.success(elapsed);
                    }
                    return (Ok(data), attempts);
                }
                Err(error) => error,
            };

            if error.is_dependency_failure() {
                if let Some(permit) = permit {
                    permit.failure(elapsed);
                }
                self.events.append(
                    events::COMPONENT_FAILURE,
                    Some(&dependency),
                    json!({
                        "dependency": dependency,
                        "request_id": request.id,
                        "attempt": attempts,
                        "error": error.to_string(),
                    }),
                );
            } else if let Some(permit) = permit {
                // The dependency answered; the request itself was bad
                permit.success(elapsed);
            }

            if !error.is_retryable() {
                return (Err(error), attempts);
            }
            if !self.backoff.should_retry(attempts) {
                return (
                    Err(OrchestratorError::RetriesExhausted {
                        dependency: dependency.clone(),
                        attempts,
                        last_error: error.to_string(),
                    }),
                    attempts,
                );
            }

            let delay = self.backoff.delay_for(attempts);
            self.events.append(
                events::WORK_RETRY_SCHEDULED,
                Some(&request.id),
                json!({
                    "dependency": dependency,
                    "attempt": attempts,
                    "delay_ms": delay.as_millis() as u64,
                    "error": error.to_string(),
                }),
            );
            debug!(
                request_id = %request.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "🔁 Retry scheduled"
            );

            if !self.wait_or_shutdown(delay).await {
                return (
                    Err(OrchestratorError::Cancelled(format!(
                        "retry of {} interrupted by shutdown",
                        request.id
                    ))),
                    attempts,
                );
            }
        }
    }

    /// Sleep for `delay`; false if shutdown was signalled first
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    /// Ingest an event from another subsystem or an external collaborator
    ///
    /// `component.failure` and `component.recovered` events that name a
    /// `dependency` drive that dependency's circuit breaker.
    pub fn handle_event(&self, event: IncomingEvent) -> SystemEvent {
        let recorded = self.events.append_incoming(event);

        if self.breakers.is_enabled() {
            if let Some(dependency) = recorded.payload_str("dependency") {
                match recorded.event_type.as_str() {
                    events::COMPONENT_FAILURE => {
                        self.breakers
                            .get_circuit_breaker(dependency)
                            .record_failure(Duration::ZERO);
                    }
                    events::COMPONENT_RECOVERED => {
                        self.breakers
                            .get_circuit_breaker(dependency)
                            .record_success(Duration::ZERO);
                    }
                    _ => {}
                }
            }
        }

        recorded
    }

    pub fn queue_status(&self) -> QueueStatus {
        let queue = self.queue.lock();
        QueueStatus {
            size: queue.len(),
            processing: self.processing.load(Ordering::SeqCst),
            by_priority: queue.len_by_priority(),
            max_queue_depth: self.config.max_queue_depth,
        }
    }

    /// Run the processing loop until [`shutdown`](Self::shutdown)
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(
                interval_ms = this.config.processing_interval_ms,
                max_concurrent = this.config.max_concurrent_requests,
                "🔄 Work processing loop started"
            );
            let mut ticker = interval(this.config.processing_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => this.dispatch_ready().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Work processing loop shutting down");
        })
    }

    /// Dispatch queued work while concurrency permits are available
    async fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.concurrency).try_acquire_owned() else {
                return;
            };
            let Some(work) = self.dequeue() else {
                return;
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run(work).await;
                drop(permit);
            });

            tokio::task::yield_now().await;
        }
    }

    /// Stop the processing loop and cancel pending retry waits
    pub fn shutdown(&self) {
        info!("🛑 Workflow orchestrator shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerComponentConfig, CircuitBreakerConfig};
    use crate::orchestration::handlers::FnWorkHandler;
    use crate::orchestration::types::WorkPriority;
    use crate::resilience::CircuitState;
    use std::sync::atomic::AtomicU32;

    fn orchestrator(max_depth: usize, failure_threshold: u32) -> (Arc<WorkflowOrchestrator>, EventStore) {
        let events = EventStore::default();
        let breakers = CircuitBreakerConfig {
            default_config: CircuitBreakerComponentConfig {
                failure_threshold,
                timeout_seconds: 60,
                success_threshold: 1,
            },
            ..Default::default()
        };
        let orchestrator = WorkflowOrchestrator::new(
            QueueConfig {
                max_queue_depth: max_depth,
                ..Default::default()
            },
            BackoffConfig {
                base_delay_ms: 10,
                max_delay_ms: 100,
                max_attempts: 3,
                ..Default::default()
            },
            Arc::new(CircuitBreakerManager::from_config(&breakers, events.clone())),
            events.clone(),
        );
        (Arc::new(orchestrator), events)
    }

    fn echo_handler() -> Arc<dyn WorkHandler> {
        Arc::new(FnWorkHandler::new("echo", |request: WorkRequest| async move {
            Ok::<Value, OrchestratorError>(request.payload)
        }))
    }

    #[tokio::test]
    async fn test_priority_then_fifo_processing_order() {
        let (orchestrator, _) = orchestrator(100, 5);
        orchestrator.register_handler(WorkKind::Maintenance, echo_handler());

        for (id, priority) in [
            ("A", WorkPriority::Normal),
            ("B", WorkPriority::Critical),
            ("C", WorkPriority::Normal),
        ] {
            orchestrator
                .submit(
                    WorkRequest::new(WorkKind::Maintenance, json!({}))
                        .with_id(id)
                        .with_priority(priority),
                )
                .unwrap();
        }

        let order: Vec<String> = orchestrator
            .process_all()
            .await
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_overload_sheds_low_priority_only() {
        let (orchestrator, events) = orchestrator(2, 5);
        for _ in 0..2 {
            orchestrator
                .submit(WorkRequest::new(WorkKind::Maintenance, json!({})))
                .unwrap();
        }

        let shed = orchestrator.submit(
            WorkRequest::new(WorkKind::Maintenance, json!({})).with_priority(WorkPriority::Low),
        );
        assert!(matches!(shed, Err(OrchestratorError::Overload { .. })));

        let normal = orchestrator.submit(WorkRequest::new(WorkKind::Maintenance, json!({})));
        assert!(normal.is_err());

        for priority in [WorkPriority::High, WorkPriority::Critical] {
            assert!(orchestrator
                .submit(WorkRequest::new(WorkKind::Maintenance, json!({})).with_priority(priority))
                .is_ok());
        }

        assert_eq!(orchestrator.queue_status().size, 4);
        let overloads = events
            .get_history(None)
            .into_iter()
            .filter(|e| e.event_type == events::SYSTEM_OVERLOAD)
            .count();
        assert_eq!(overloads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_succeed() {
        let (orchestrator, events) = orchestrator(100, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        orchestrator.register_handler(
            WorkKind::ComponentOp,
            Arc::new(FnWorkHandler::new("registry", move |_req: WorkRequest| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OrchestratorError::transient("registry", "connection reset"))
                    } else {
                        Ok(json!({"published": true}))
                    }
                }
            })),
        );

        let ticket = orchestrator
            .submit(WorkRequest::new(WorkKind::ComponentOp, json!({})))
            .unwrap();
        let result = orchestrator.process_next().await.unwrap();

        assert!(result.success);
        assert_eq!(result.metrics.attempts, 3);
        assert_eq!(ticket.wait().await.unwrap(), result);
        let retries = events
            .get_history(None)
            .into_iter()
            .filter(|e| e.event_type == events::WORK_RETRY_SCHEDULED)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surfaces_failure() {
        let (orchestrator, events) = orchestrator(100, 10);
        orchestrator.register_handler(
            WorkKind::ComponentOp,
            Arc::new(FnWorkHandler::new("registry", |_req: WorkRequest| async {
                Err::<Value, _>(OrchestratorError::transient("registry", "timeout"))
            })),
        );

        orchestrator
            .submit(WorkRequest::new(WorkKind::ComponentOp, json!({})).with_id("r1"))
            .unwrap();
        let result = orchestrator.process_next().await.unwrap();

        assert!(!result.success);
        assert_eq!(result.metrics.attempts, 3);
        let error = result.error.unwrap();
        assert_eq!(
            error.category,
            crate::error::ErrorCategory::TransientDependency
        );
        assert!(error.message.contains("Retries exhausted"));
        let failed = events.events_for_entity("r1");
        assert_eq!(failed.last().unwrap().event_type, events::WORK_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_without_calling() {
        let (orchestrator, _) = orchestrator(100, 3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        orchestrator.register_handler(
            WorkKind::ComponentOp,
            Arc::new(FnWorkHandler::new("builder", move |_req: WorkRequest| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(OrchestratorError::permanent("builder", "500"))
                }
            })),
        );

        for _ in 0..4 {
            orchestrator
                .submit(WorkRequest::new(WorkKind::ComponentOp, json!({})))
                .unwrap();
        }
        let results = orchestrator.process_all().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let last = results.last().unwrap().error.clone().unwrap();
        assert_eq!(last.category, crate::error::ErrorCategory::CircuitOpen);
        assert_eq!(results.last().unwrap().metrics.attempts, 0);
    }

    #[tokio::test]
    async fn test_handle_event_drives_breaker() {
        let (orchestrator, _) = orchestrator(100, 2);
        for _ in 0..2 {
            orchestrator.handle_event(IncomingEvent::new(
                events::COMPONENT_FAILURE,
                json!({"dependency": "artifact-store"}),
            ));
        }
        let status = orchestrator.breakers.status();
        assert_eq!(status["artifact-store"].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_with_validation() {
        let (orchestrator, _) = orchestrator(100, 5);
        orchestrator
            .submit(WorkRequest::new(WorkKind::Generation, json!({"languages": ["rust"]})))
            .unwrap();
        let result = orchestrator.process_next().await.unwrap();
        assert_eq!(
            result.error.unwrap().category,
            crate::error::ErrorCategory::Validation
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_processes_and_stops() {
        let (orchestrator, _) = orchestrator(100, 5);
        orchestrator.register_handler(WorkKind::Maintenance, echo_handler());
        let handle = orchestrator.start();

        let ticket = orchestrator
            .submit(WorkRequest::new(WorkKind::Maintenance, json!({"x": 1})))
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["x"], 1);

        orchestrator.shutdown();
        handle.await.unwrap();
        assert!(orchestrator.is_shutdown());
    }
}
