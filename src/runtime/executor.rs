/// Flow executor
///
/// Submissions are written to history as PENDING and queued on a channel. A
/// single dispatcher takes them in submission order, waits for a slot on a
/// fair semaphore of `max_workers` permits and spawns the run. Each run
/// installs its execution context, drives the flow body and writes exactly
/// one terminal status.
///
/// Task calls made from inside a flow body go through [`call_task`], which
/// records one attempt row per try and applies the task's retry policy.

use crate::error::{EngineError, EngineResult};
use crate::history::{
    AttemptOutcome, ErrorDetail, Execution, ExecutionOrigin, ExecutionOutcome, ExecutionStatus,
    HistoryStore, TaskAttempt,
};
use crate::runtime::context::{current_scope, RunScope, TaskScope};
use crate::workflow::{FlowDefinition, Params, Registry};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// Invoke a registered task from inside a flow body.
///
/// Creates a RUNNING attempt row, runs the body and records the outcome. On
/// failure the task's retry policy decides whether to sleep and try again
/// under the same sequence number. Once attempts are exhausted the error is
/// returned as `TaskFailure` for the flow body to handle or propagate.
///
/// Fails with `NoActiveExecution` outside a run and with `Cancelled` once
/// cancellation has been requested for the execution.
pub async fn call_task(name: &str, input: Value) -> EngineResult<Value> {
    let scope = current_scope()?;
    run_task(&scope, name, input).await
}

async fn run_task(scope: &RunScope, name: &str, input: Value) -> EngineResult<Value> {
    if scope.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let task = scope.registry.get_task(name)?;
    let seq = scope.next_seq();
    let logger = scope.logger.for_task(seq);
    let max_attempts = task.retry.max_attempts();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = task.retry.backoff.delay(attempt - 2);
            logger.warn(format!(
                "Retrying task '{}' in {:?} (attempt {}/{})",
                name, delay, attempt, max_attempts
            ));
            scope.flush_logs().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
        if scope.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if scope.is_closed() {
            return Err(EngineError::NoActiveExecution);
        }

        let row = TaskAttempt::running(&scope.execution_id, seq, attempt, name, input.clone());
        scope.store.record_task_attempt(&row).await?;
        logger.info(format!("Task '{}' started (attempt {}/{})", name, attempt, max_attempts));

        let started = Instant::now();
        let body = Arc::clone(&task.body);
        let task_input = input.clone();
        let result = TaskScope { seq, attempt }
            .enter(AssertUnwindSafe(async move { body(task_input).await }).catch_unwind())
            .await;

        let outcome = match result {
            Ok(Ok(output)) => {
                logger.info(format!("Task '{}' succeeded in {:?}", name, started.elapsed()));
                scope.flush_logs().await;
                scope
                    .store
                    .finalize_task(
                        &scope.execution_id,
                        seq,
                        attempt,
                        &AttemptOutcome::Succeeded(output.clone()),
                        Utc::now(),
                    )
                    .await?;
                return Ok(output);
            }
            Ok(Err(err)) => {
                last_error = err.to_string();
                ErrorDetail::from_anyhow("TaskFailure", &err)
            }
            Err(panic) => {
                last_error = format!("task panicked: {}", panic_message(&*panic));
                ErrorDetail::new("TaskFailure", last_error.clone())
            }
        };

        logger.error(format!(
            "Task '{}' failed (attempt {}/{}): {}",
            name, attempt, max_attempts, last_error
        ));
        scope.flush_logs().await;
        scope
            .store
            .finalize_task(
                &scope.execution_id,
                seq,
                attempt,
                &AttemptOutcome::Failed(outcome),
                Utc::now(),
            )
            .await?;
    }

    Err(EngineError::TaskFailure {
        task: name.to_string(),
        attempts: max_attempts,
        message: last_error,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a submitted execution
#[derive(Clone)]
pub struct ExecutionHandle {
    execution_id: String,
    status: watch::Receiver<ExecutionStatus>,
    store: Arc<dyn HistoryStore>,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Latest known status
    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Status updates; values only ever move forward
    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.clone()
    }

    /// Wait for the terminal status and return the stored execution
    pub async fn wait(&self) -> EngineResult<Execution> {
        let mut status = self.status.clone();
        // Err only if the executor went away; the stored row is still the answer
        let _ = status.wait_for(|s| s.is_terminal()).await;
        self.store
            .get_execution(&self.execution_id)
            .await?
            .ok_or_else(|| EngineError::execution_not_found(&self.execution_id))
    }
}

/// Per-run control block, present while the run is queued or running
struct RunControl {
    cancel: CancellationToken,
    started: bool,
    status: Arc<watch::Sender<ExecutionStatus>>,
}

struct QueuedRun {
    execution_id: String,
    flow: Arc<FlowDefinition>,
    params: Params,
    cancel: CancellationToken,
    status: Arc<watch::Sender<ExecutionStatus>>,
}

struct Shared {
    registry: Arc<Registry>,
    store: Arc<dyn HistoryStore>,
    runs: Mutex<HashMap<String, RunControl>>,
}

impl Shared {
    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunControl>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn forget(&self, execution_id: &str) {
        self.runs().remove(execution_id);
    }
}

/// Runs flows under a FIFO concurrency ceiling
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<QueuedRun>,
    max_workers: usize,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

impl Executor {
    /// Create the executor and spawn its dispatcher.
    ///
    /// Must be called from within a Tokio runtime. The dispatcher stops once
    /// every clone of the executor is dropped.
    pub fn new(registry: Arc<Registry>, store: Arc<dyn HistoryStore>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let shared = Arc::new(Shared {
            registry,
            store,
            runs: Mutex::new(HashMap::new()),
        });
        let (queue, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(max_workers));

        tokio::spawn(dispatch(Arc::clone(&shared), rx, semaphore));
        tracing::info!("⚙️ Executor started with {} worker slot(s)", max_workers);

        Self {
            shared,
            queue,
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.shared.store
    }

    /// Submit and wait for the terminal state
    pub async fn submit(&self, flow_id: &str, params: Params) -> EngineResult<Execution> {
        self.submit_async(flow_id, params).await?.wait().await
    }

    /// Submit and return immediately with a pollable handle
    pub async fn submit_async(&self, flow_id: &str, params: Params) -> EngineResult<ExecutionHandle> {
        self.submit_with_origin(flow_id, params, ExecutionOrigin::Manual)
            .await
    }

    /// Submit with an explicit origin.
    ///
    /// An unknown flow id does not fail the call: the execution is recorded
    /// as FAILED with the resolution error and the body never runs. Errors
    /// are returned only when history itself cannot be written.
    pub async fn submit_with_origin(
        &self,
        flow_id: &str,
        params: Params,
        origin: ExecutionOrigin,
    ) -> EngineResult<ExecutionHandle> {
        let execution = Execution::pending(flow_id, params, origin);
        self.shared.store.create_execution(&execution).await?;

        let flow = match self.shared.registry.get_flow(flow_id) {
            Ok(flow) => flow,
            Err(err) => {
                tracing::warn!(execution_id = %execution.id, "⚠️ Cannot resolve flow '{}': {}", flow_id, err);
                let outcome = ExecutionOutcome::Failed(ErrorDetail::new(err.kind_name(), err.to_string()));
                return self.fail_immediately(execution.id, outcome).await;
            }
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(ExecutionStatus::Pending);
        let tx = Arc::new(tx);
        self.shared.runs().insert(
            execution.id.clone(),
            RunControl {
                cancel: cancel.clone(),
                started: false,
                status: Arc::clone(&tx),
            },
        );

        let queued = QueuedRun {
            execution_id: execution.id.clone(),
            flow,
            params: execution.params,
            cancel,
            status: tx,
        };
        if self.queue.send(queued).is_err() {
            self.shared.forget(&execution.id);
            let outcome = ExecutionOutcome::Failed(ErrorDetail::new("FlowFailure", "executor is shut down"));
            return self.fail_immediately(execution.id, outcome).await;
        }

        tracing::debug!(execution_id = %execution.id, "📥 Queued flow '{}'", flow_id);
        Ok(ExecutionHandle {
            execution_id: execution.id,
            status: rx,
            store: Arc::clone(&self.shared.store),
        })
    }

    async fn fail_immediately(
        &self,
        execution_id: String,
        outcome: ExecutionOutcome,
    ) -> EngineResult<ExecutionHandle> {
        self.shared
            .store
            .finalize_execution(&execution_id, &outcome, Utc::now())
            .await?;
        let (_, rx) = watch::channel(outcome.status());
        Ok(ExecutionHandle {
            execution_id,
            status: rx,
            store: Arc::clone(&self.shared.store),
        })
    }

    /// Request cancellation.
    ///
    /// A queued execution is finalized CANCELLED right away and its body never
    /// runs. A running one is cancelled at its next task-call boundary.
    /// Returns false if the execution had already finished.
    pub async fn cancel(&self, execution_id: &str) -> EngineResult<bool> {
        let control = {
            let runs = self.shared.runs();
            runs.get(execution_id).map(|control| {
                control.cancel.cancel();
                (control.started, Arc::clone(&control.status))
            })
        };

        match control {
            Some((true, _)) => {
                tracing::info!(execution_id, "🛑 Cancellation requested for running execution");
                Ok(true)
            }
            Some((false, status)) => {
                self.shared.forget(execution_id);
                let outcome = ExecutionOutcome::Cancelled(ErrorDetail::new(
                    "Cancelled",
                    "cancelled before start",
                ));
                self.shared
                    .store
                    .finalize_execution(execution_id, &outcome, Utc::now())
                    .await?;
                status.send_replace(ExecutionStatus::Cancelled);
                tracing::info!(execution_id, "🛑 Cancelled queued execution");
                Ok(true)
            }
            None => match self.shared.store.get_execution(execution_id).await? {
                Some(_) => Ok(false),
                None => Err(EngineError::execution_not_found(execution_id)),
            },
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        self.shared
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::execution_not_found(execution_id))
    }
}

/// Admit queued runs in submission order as slots free up
async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<QueuedRun>,
    semaphore: Arc<Semaphore>,
) {
    while let Some(run) = rx.recv().await {
        let permit = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => continue,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_execution(&shared, run).await;
            drop(permit);
        });
    }
    tracing::debug!("Executor dispatcher stopped");
}

async fn run_execution(shared: &Shared, run: QueuedRun) {
    let id = run.execution_id;
    {
        let mut runs = shared.runs();
        match runs.get_mut(&id) {
            Some(control) if !control.cancel.is_cancelled() => control.started = true,
            // cancelled while queued; cancel() already finalized it
            _ => return,
        }
    }

    let flow_id = run.flow.flow_id.clone();
    match shared.store.record_execution_start(&id, Utc::now()).await {
        Ok(true) => {}
        Ok(false) => {
            shared.forget(&id);
            return;
        }
        Err(e) => {
            tracing::error!(execution_id = %id, "❌ Failed to mark execution running: {}", e);
            let outcome = ExecutionOutcome::Failed(ErrorDetail::new(e.kind_name(), e.to_string()));
            let _ = shared.store.finalize_execution(&id, &outcome, Utc::now()).await;
            run.status.send_replace(ExecutionStatus::Failed);
            shared.forget(&id);
            return;
        }
    }
    run.status.send_replace(ExecutionStatus::Running);

    let scope = Arc::new(RunScope::new(
        &id,
        &flow_id,
        run.cancel.clone(),
        Arc::clone(&shared.registry),
        Arc::clone(&shared.store),
    ));
    let started = Instant::now();
    tracing::info!(execution_id = %id, "🚀 Starting flow '{}'", flow_id);
    scope.logger.info(format!("Flow '{}' started", flow_id));

    let body = Arc::clone(&run.flow.body);
    let params = run.params;
    let result = Arc::clone(&scope)
        .enter(AssertUnwindSafe(async move { body(params).await }).catch_unwind())
        .await;

    let outcome = match result {
        Ok(Ok(output)) => {
            scope.logger.info(format!("Flow '{}' succeeded in {:?}", flow_id, started.elapsed()));
            ExecutionOutcome::Succeeded(output)
        }
        Ok(Err(err)) if run.cancel.is_cancelled() => {
            scope.logger.warn(format!("Flow '{}' cancelled: {}", flow_id, err));
            ExecutionOutcome::Cancelled(ErrorDetail::from_anyhow("Cancelled", &err))
        }
        Ok(Err(err)) => {
            let kind = err
                .downcast_ref::<EngineError>()
                .map(EngineError::kind_name)
                .unwrap_or("FlowFailure");
            scope.logger.error(format!("Flow '{}' failed: {:#}", flow_id, err));
            ExecutionOutcome::Failed(ErrorDetail::from_anyhow(kind, &err))
        }
        Err(panic) => {
            let message = format!("flow body panicked: {}", panic_message(&*panic));
            scope.logger.error(format!("Flow '{}' failed: {}", flow_id, message));
            ExecutionOutcome::Failed(ErrorDetail::new("FlowFailure", message))
        }
    };

    scope.flush_logs().await;
    scope.close();
    let status = outcome.status();
    if let Err(e) = shared.store.finalize_execution(&id, &outcome, Utc::now()).await {
        tracing::error!(execution_id = %id, "❌ Failed to finalize execution: {}", e);
    }
    run.status.send_replace(status);
    shared.forget(&id);

    match status {
        ExecutionStatus::Succeeded => {
            tracing::info!(execution_id = %id, "✅ Flow '{}' completed in {:?}", flow_id, started.elapsed())
        }
        _ => tracing::warn!(execution_id = %id, "⚠️ Flow '{}' finished as {}", flow_id, status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::workflow::{RetryPolicy, TaskDefinition};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn executor(registry: Registry, max_workers: usize) -> Executor {
        Executor::new(
            Arc::new(registry),
            Arc::new(MemoryHistoryStore::new()),
            max_workers,
        )
    }

    #[tokio::test]
    async fn retries_record_every_attempt() {
        let registry = Registry::new();
        registry
            .register_task_definition(
                TaskDefinition::new("flaky", |_| async { anyhow::bail!("still broken") })
                    .with_retry(RetryPolicy::exponential(2, Duration::from_millis(1))),
            )
            .unwrap();
        registry
            .register_flow("f", "F", "", |_| async {
                call_task("flaky", json!(null)).await?;
                Ok(json!("unreachable"))
            })
            .unwrap();

        let execution = executor(registry, 1).submit("f", Params::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.tasks.len(), 1);
        let task = &execution.tasks[0];
        assert_eq!(task.attempt_count(), 3);
        assert!(task.attempts.iter().all(|a| a.status == ExecutionStatus::Failed));
        assert_eq!(execution.error.unwrap().kind, "TaskFailure");
    }

    #[tokio::test]
    async fn retry_can_recover() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registry = Registry::new();
        registry
            .register_task_definition(
                TaskDefinition::new("second_time_lucky", move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("first try fails");
                        }
                        Ok(json!("done"))
                    }
                })
                .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1))),
            )
            .unwrap();
        registry
            .register_flow("f", "F", "", |_| async { Ok(call_task("second_time_lucky", json!(1)).await?) })
            .unwrap();

        let execution = executor(registry, 1).submit("f", Params::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output, Some(json!("done")));
        let attempts = &execution.tasks[0].attempts;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, ExecutionStatus::Failed);
        assert_eq!(attempts[1].status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn flow_can_recover_from_task_failure() {
        let registry = Registry::new();
        registry
            .register_task("boom", "", |_| async { anyhow::bail!("nope") })
            .unwrap();
        registry
            .register_flow("f", "F", "", |_| async {
                match call_task("boom", json!(null)).await {
                    Err(EngineError::TaskFailure { attempts, .. }) => Ok(json!({"recovered": attempts})),
                    other => anyhow::bail!("unexpected: {:?}", other),
                }
            })
            .unwrap();

        let execution = executor(registry, 1).submit("f", Params::new()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output, Some(json!({"recovered": 1})));
        assert_eq!(execution.tasks[0].status(), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_flow_is_recorded_as_failed() {
        let execution = executor(Registry::new(), 1)
            .submit("missing", Params::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let error = execution.error.unwrap();
        assert_eq!(error.kind, "NotFound");
        assert!(error.message.contains("missing"));
    }

    #[tokio::test]
    async fn panicking_flow_fails_cleanly() {
        let registry = Registry::new();
        registry
            .register_flow("f", "F", "", |_| async { panic!("kaboom") })
            .unwrap();

        let execution = executor(registry, 1).submit("f", Params::new()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().message.contains("kaboom"));
    }

    #[tokio::test]
    async fn logs_are_persisted_with_task_tags() {
        let registry = Registry::new();
        registry
            .register_task("noisy", "", |_| async {
                crate::runtime::current_logger()?.info("inside task");
                Ok(json!(null))
            })
            .unwrap();
        registry
            .register_flow("f", "F", "", |_| async {
                call_task("noisy", json!(null)).await?;
                Ok(json!(null))
            })
            .unwrap();

        let executor = executor(registry, 1);
        let execution = executor.submit("f", Params::new()).await.unwrap();
        let logs = executor.store().logs(&execution.id).await.unwrap();

        let inside = logs.iter().find(|l| l.message == "inside task").unwrap();
        assert_eq!(inside.task_seq, Some(1));
        assert!(logs.first().unwrap().message.contains("started"));
    }

    #[tokio::test]
    async fn queued_execution_can_be_cancelled_before_start() {
        let registry = Registry::new();
        registry
            .register_flow("slow", "Slow", "", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(null))
            })
            .unwrap();
        let executor = executor(registry, 1);

        let first = executor.submit_async("slow", Params::new()).await.unwrap();
        let second = executor.submit_async("slow", Params::new()).await.unwrap();
        assert!(executor.cancel(second.execution_id()).await.unwrap());

        let second = second.wait().await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Cancelled);
        assert!(second.started_at.is_none());

        let first = first.wait().await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Succeeded);
        assert!(!executor.cancel(&first.id).await.unwrap());
        assert!(executor.cancel("nope").await.is_err());
    }

    #[tokio::test]
    async fn branches_cannot_write_tasks_after_the_run_ends() {
        let registry = Registry::new();
        registry
            .register_task("slow", "", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .unwrap();
        registry
            .register_flow("late_branch", "Late branch", "", |_| async {
                crate::runtime::spawn_branch(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    call_task("slow", json!(null)).await
                });
                Ok(json!("returned early"))
            })
            .unwrap();
        registry
            .register_flow("early_branch", "Early branch", "", |_| async {
                crate::runtime::spawn_branch(call_task("slow", json!(null)));
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("returned early"))
            })
            .unwrap();
        let executor = executor(registry, 2);

        let late = executor.submit("late_branch", Params::new()).await.unwrap();
        let early = executor.submit("early_branch", Params::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let late = executor.get_execution(&late.id).await.unwrap();
        assert_eq!(late.status, ExecutionStatus::Succeeded);
        assert!(late.tasks.is_empty());

        let early = executor.get_execution(&early.id).await.unwrap();
        assert_eq!(early.status, ExecutionStatus::Succeeded);
        assert_eq!(early.tasks.len(), 1);
        assert_eq!(early.tasks[0].status(), ExecutionStatus::Failed);
        assert_eq!(early.tasks[0].attempts[0].error.as_ref().unwrap().kind, "Interrupted");
    }
}
