use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use yggdrasil_client::ResilientClient;
use yggdrasil_domain::{HostDescriptor, Task, TaskStatus};
use yggdrasil_errors::DispatchError;
use yggdrasil_ledger::{Ledger, TaskUpdate};
use yggdrasil_observability::{
    event, ErrorContext, ErrorTracker, Event, EventLog, MetricsCollector,
};

use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::pool::HostPool;
use crate::router::Router;

struct Shared {
    ledger: Ledger,
    pool: Arc<HostPool>,
    registry: HandlerRegistry,
    handler_ctx: HandlerContext,
    events: Arc<EventLog>,
    metrics: Arc<MetricsCollector>,
    errors: Arc<ErrorTracker>,
    /// task_id -> host name for everything currently claimed by a unit.
    in_flight: Mutex<HashMap<String, String>>,
}

/// The main loop: poll the ready queue, claim a slot per task, spawn a
/// processing unit, and drain gracefully on shutdown.
pub struct Dispatcher {
    shared: Arc<Shared>,
    router: Arc<Router>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Ledger,
        router: Arc<Router>,
        pool: Arc<HostPool>,
        registry: HandlerRegistry,
        client: Arc<ResilientClient>,
        events: Arc<EventLog>,
        metrics: Arc<MetricsCollector>,
        errors: Arc<ErrorTracker>,
        poll_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let handler_ctx = HandlerContext {
            router: Arc::clone(&router),
            client,
        };
        Self {
            shared: Arc::new(Shared {
                ledger,
                pool,
                registry,
                handler_ctx,
                events,
                metrics,
                errors,
                in_flight: Mutex::new(HashMap::new()),
            }),
            router,
            poll_interval,
            shutdown_timeout,
        }
    }

    /// Run until the shutdown signal fires, then drain in-flight tasks
    /// within the grace window. A handler failure never exits the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "dispatcher started"
        );
        let mut units: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            while units.try_join_next().is_some() {}

            let ready = match self.shared.ledger.ready_tasks().await {
                Ok(ready) => ready,
                Err(e) => {
                    error!(error = %e, "failed to query ready queue");
                    continue;
                }
            };

            for task in ready {
                self.maybe_dispatch(task, &mut units).await;
            }

            let status = self.shared.pool.status().await;
            let busy: usize = status.values().map(|s| s.active).sum();
            if busy > 0 {
                debug!(busy, "tasks in flight");
            }
        }

        self.drain(units).await;
    }

    async fn maybe_dispatch(&self, task: Task, units: &mut JoinSet<()>) {
        if self.shared.in_flight.lock().await.contains_key(&task.id) {
            return;
        }

        let host = match self.router.route(&task) {
            Ok(host) => host,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "no route for task");
                return;
            }
        };

        // Do not park tasks on a saturated host: skipping keeps the
        // ready-queue order authoritative across polls.
        let permit = match self.shared.pool.try_acquire(&host.name) {
            Ok(Some(permit)) => permit,
            Ok(None) => return,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "slot acquisition failed");
                return;
            }
        };

        self.shared
            .in_flight
            .lock()
            .await
            .insert(task.id.clone(), host.name.clone());
        info!(task_id = %task.id, host = %host.name, "dispatching task");

        let shared = Arc::clone(&self.shared);
        units.spawn(async move {
            let task_id = task.id.clone();
            process_task(&shared, task, host, permit).await;
            shared.in_flight.lock().await.remove(&task_id);
        });
    }

    async fn drain(&self, mut units: JoinSet<()>) {
        let pending = units.len();
        self.shared
            .events
            .emit(Event::new(event::SHUTDOWN_BEGIN).field("in_flight", pending as u64))
            .await;
        info!(pending, "shutdown: waiting for in-flight tasks");

        let deadline = Instant::now() + self.shutdown_timeout;
        while !units.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, units.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if !units.is_empty() {
            warn!(
                stragglers = units.len(),
                "grace period expired, aborting remaining tasks"
            );
            units.abort_all();
            while units.join_next().await.is_some() {}

            let stranded: Vec<(String, String)> =
                self.shared.in_flight.lock().await.drain().collect();
            for (task_id, host) in stranded {
                let update = TaskUpdate::with_error(
                    "shutdown: grace period expired before the task completed",
                )
                .message("shutdown");
                match self
                    .shared
                    .ledger
                    .update(&task_id, TaskStatus::Blocked, update)
                    .await
                {
                    Ok(()) => {
                        warn!(task_id = task_id.as_str(), "task blocked by shutdown");
                    }
                    Err(DispatchError::InvalidTransition { .. }) => {
                        // Claimed but never marked in_progress; it stays
                        // open and is picked up on the next run.
                        debug!(task_id = task_id.as_str(), "task untouched by shutdown");
                    }
                    Err(e) => {
                        error!(task_id = task_id.as_str(), error = %e, "shutdown update failed");
                    }
                }
                self.shared.pool.unregister_task(&host, &task_id).await;
            }
        }

        self.shared.events.emit(Event::new(event::SHUTDOWN_END)).await;
        info!("dispatcher stopped");
    }
}

/// One task-processing unit. Owns exactly one host slot for its whole
/// lifetime; the permit drops on every exit path, including abort.
async fn process_task(
    shared: &Shared,
    task: Task,
    host: HostDescriptor,
    permit: OwnedSemaphorePermit,
) {
    let task_type = task.effective_type().to_string();
    shared.pool.register_task(&host.name, &task.id).await;
    let started = Instant::now();
    let attempt = task.attempt_count + 1;

    let claim = shared
        .ledger
        .update(
            &task.id,
            TaskStatus::InProgress,
            TaskUpdate::default().attempt(attempt),
        )
        .await;
    if let Err(e) = claim {
        // Someone moved the task since the poll snapshot; back off.
        debug!(task_id = %task.id, error = %e, "lost claim on task");
        shared.pool.unregister_task(&host.name, &task.id).await;
        drop(permit);
        return;
    }

    shared
        .events
        .emit(
            Event::new(event::TASK_STARTED)
                .task(&task.id)
                .field("task_type", task_type.as_str())
                .field("host", host.name.as_str())
                .field("attempt", attempt),
        )
        .await;

    let handler = shared.registry.resolve(&task_type);
    let outcome = handler.execute(&task, &shared.handler_ctx).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(output) => {
            let final_attempt = task.attempt_count + output.attempts.max(1) as i64;
            let commit = shared
                .ledger
                .update(
                    &task.id,
                    TaskStatus::Closed,
                    TaskUpdate::with_result(&output.output).attempt(final_attempt),
                )
                .await;
            match commit {
                Ok(()) => {
                    shared
                        .metrics
                        .record_task(&host.name, "success", duration_ms)
                        .await;
                    if output.tokens_in > 0 || output.tokens_out > 0 {
                        shared
                            .metrics
                            .record_tokens(&host.name, output.tokens_in, output.tokens_out)
                            .await;
                    }
                    shared
                        .events
                        .emit(
                            Event::new(event::TASK_COMPLETED)
                                .task(&task.id)
                                .field("host", host.name.as_str())
                                .field("duration_ms", duration_ms)
                                .field("tokens_in", output.tokens_in)
                                .field("tokens_out", output.tokens_out),
                        )
                        .await;
                }
                Err(e) => discard_or_report(shared, &task.id, e).await,
            }
        }
        Err(e) => {
            let context = ErrorContext {
                task_type: task_type.clone(),
                host: host.name.clone(),
                attempt,
                output_tail: None,
            };
            let report = shared.errors.track(&task.id, &e, &context).await;
            let commit = shared
                .ledger
                .update(
                    &task.id,
                    TaskStatus::Blocked,
                    TaskUpdate::with_error(report).message(e.kind()),
                )
                .await;
            match commit {
                Ok(()) => {
                    shared
                        .metrics
                        .record_task(&host.name, "failed", duration_ms)
                        .await;
                    shared
                        .events
                        .emit(
                            Event::new(event::TASK_FAILED)
                                .error()
                                .task(&task.id)
                                .field("host", host.name.as_str())
                                .field("error_kind", e.kind())
                                .field("error", e.to_string())
                                .field("duration_ms", duration_ms),
                        )
                        .await;
                }
                Err(commit_err) => discard_or_report(shared, &task.id, commit_err).await,
            }
        }
    }

    shared.pool.unregister_task(&host.name, &task.id).await;
    drop(permit);
}

/// A terminal commit can collide with an operator cancellation; that race
/// is the advisory-cancel path and the result is simply dropped. Any
/// other invalid transition here is a bug.
async fn discard_or_report(shared: &Shared, task_id: &str, e: DispatchError) {
    if matches!(e, DispatchError::InvalidTransition { .. }) {
        if let Ok(task) = shared.ledger.get(task_id).await {
            if task.status == TaskStatus::Cancelled {
                debug!(task_id, "task cancelled mid-flight, discarding result");
                return;
            }
        }
        error!(task_id, error = %e, "invalid transition committing terminal status");
    } else {
        error!(task_id, error = %e, "failed to commit terminal status");
    }
}
