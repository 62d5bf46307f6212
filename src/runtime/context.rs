/// Execution context
///
/// Each flow run installs one `RunScope` as a Tokio task-local for the
/// duration of its body. Anything awaited inside the body, however deeply
/// nested, can reach the run's logger and history without the scope being
/// passed around; futures polled by other executions never see it.
///
/// Work spawned onto new Tokio tasks leaves the scope behind unless it goes
/// through [`spawn_branch`].

use crate::error::{EngineError, EngineResult};
use crate::history::{HistoryStore, Remark, RemarkLevel};
use crate::runtime::logger::FlowLogger;
use crate::workflow::Registry;
use chrono::Utc;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

tokio::task_local! {
    static RUN_SCOPE: Arc<RunScope>;
    static TASK_SCOPE: TaskScope;
}

/// State shared by everything running on behalf of one execution
pub(crate) struct RunScope {
    pub(crate) execution_id: String,
    pub(crate) flow_id: String,
    pub(crate) logger: FlowLogger,
    pub(crate) cancel: CancellationToken,
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: Arc<dyn HistoryStore>,
    next_seq: AtomicU32,
    /// Set at teardown; branches that outlive the run lose their context
    closed: AtomicBool,
}

impl RunScope {
    pub(crate) fn new(
        execution_id: &str,
        flow_id: &str,
        cancel: CancellationToken,
        registry: Arc<Registry>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            flow_id: flow_id.to_string(),
            logger: FlowLogger::new(execution_id, flow_id),
            cancel,
            registry,
            store,
            next_seq: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Sequence number for the next task call, from 1
    pub(crate) fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Detach the scope from anything still holding it, ahead of the
    /// terminal write
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Persist buffered log lines
    pub(crate) async fn flush_logs(&self) {
        let lines = self.logger.drain();
        if lines.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_logs(&self.execution_id, &lines).await {
            tracing::error!(execution_id = %self.execution_id, "❌ Failed to persist log lines: {}", e);
        }
    }

    /// Run `fut` with this scope installed
    pub(crate) async fn enter<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        RUN_SCOPE.scope(self, fut).await
    }
}

/// Task attempt currently executing on this logical thread of control
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskScope {
    pub(crate) seq: u32,
    pub(crate) attempt: u32,
}

impl TaskScope {
    pub(crate) async fn enter<F: Future>(self, fut: F) -> F::Output {
        TASK_SCOPE.scope(self, fut).await
    }
}

pub(crate) fn current_scope() -> EngineResult<Arc<RunScope>> {
    RUN_SCOPE
        .try_with(Arc::clone)
        .ok()
        .filter(|scope| !scope.is_closed())
        .ok_or(EngineError::NoActiveExecution)
}

fn current_task() -> Option<TaskScope> {
    TASK_SCOPE.try_with(|task| *task).ok()
}

/// Logger bound to the execution running the caller.
///
/// Inside a task body the returned logger tags lines with that task's
/// sequence number. Fails with `NoActiveExecution` outside a run.
pub fn current_logger() -> EngineResult<FlowLogger> {
    let scope = current_scope()?;
    Ok(match current_task() {
        Some(task) => scope.logger.for_task(task.seq),
        None => scope.logger.clone(),
    })
}

/// Id of the execution running the caller
pub fn current_execution_id() -> EngineResult<String> {
    Ok(current_scope()?.execution_id.clone())
}

/// Whether cancellation was requested for the current execution
pub fn is_cancelled() -> bool {
    RUN_SCOPE
        .try_with(|scope| scope.cancel.is_cancelled())
        .unwrap_or(false)
}

/// Attach a remark to the current execution.
///
/// Returns false outside an execution or if the remark could not be stored.
pub async fn add_remark(level: RemarkLevel, message: impl Into<String>) -> bool {
    let Ok(scope) = current_scope() else {
        tracing::warn!("⚠️ add_remark called outside of an execution");
        return false;
    };

    let remark = Remark {
        level,
        message: message.into(),
        created_at: Utc::now(),
    };
    match scope.store.add_remark(&scope.execution_id, &remark).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(execution_id = %scope.execution_id, "❌ Failed to store remark: {}", e);
            false
        }
    }
}

/// Report progress (0-100) of the task attempt running the caller.
///
/// Out-of-range values are rejected with a warning. Returns false when not
/// called from inside a task body.
pub async fn set_progress(percent: i64, message: Option<&str>) -> bool {
    let (Ok(scope), Some(task)) = (current_scope(), current_task()) else {
        tracing::warn!("⚠️ set_progress called outside of a task");
        return false;
    };

    if !(0..=100).contains(&percent) {
        scope
            .logger
            .for_task(task.seq)
            .warn(format!("Ignoring invalid progress value {percent}; expected 0-100"));
        return false;
    }

    match scope
        .store
        .update_task_progress(
            &scope.execution_id,
            task.seq,
            task.attempt,
            percent as u8,
            message,
        )
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(execution_id = %scope.execution_id, "❌ Failed to store progress: {}", e);
            false
        }
    }
}

/// Spawn a concurrent branch of the current execution.
///
/// The branch sees the same execution context as its parent; its task calls
/// draw sequence numbers from the same counter. Outside an execution this is
/// a plain `tokio::spawn`.
pub fn spawn_branch<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_scope() {
        Ok(scope) => tokio::spawn(RUN_SCOPE.scope(scope, fut)),
        Err(_) => tokio::spawn(fut),
    }
}
