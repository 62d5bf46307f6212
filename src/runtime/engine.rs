/// Engine facade
///
/// Bundles the registry, executor, history store and trigger scheduler behind
/// the operations an API or UI layer needs. Direct calls here treat an
/// unknown flow as an error for the caller; autonomous fires from the
/// scheduler record a FAILED execution instead.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::history::{
    paginate, Execution, ExecutionQuery, HistoryStore, LogLine, MemoryHistoryStore, StatusCounts,
};
use crate::runtime::executor::{ExecutionHandle, Executor};
use crate::runtime::scheduler::{SchedulerConfig, TriggerScheduler};
use crate::trigger::{MemoryTriggerStore, MisfireEvent, Trigger, TriggerStore};
use crate::workflow::{FlowSummary, Params, Registry};
use futures::stream::BoxStream;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

/// Number of recent executions included in a flow detail
const RECENT_EXECUTIONS: u32 = 10;

/// Everything the dashboard shows for one flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowDetail {
    pub flow: FlowSummary,
    pub triggers: Vec<Trigger>,
    pub counts: StatusCounts,
    pub recent_executions: Vec<Execution>,
}

/// Workflow engine: registry + executor + history + scheduler
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    history: Arc<dyn HistoryStore>,
    executor: Executor,
    scheduler: Arc<TriggerScheduler>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("executor", &self.executor)
            .finish()
    }
}

impl Engine {
    /// Wire the engine over the given stores. Must run inside a Tokio runtime.
    pub fn new(
        registry: Arc<Registry>,
        history: Arc<dyn HistoryStore>,
        triggers: Arc<dyn TriggerStore>,
        config: &EngineConfig,
    ) -> Self {
        let executor = Executor::new(Arc::clone(&registry), Arc::clone(&history), config.max_workers);
        let scheduler = Arc::new(TriggerScheduler::new(
            executor.clone(),
            triggers,
            SchedulerConfig {
                heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
                misfire_grace: Duration::from_secs(config.misfire_grace_secs),
            },
        ));

        Self {
            registry,
            history,
            executor,
            scheduler,
        }
    }

    /// Engine with in-memory history and trigger stores
    pub fn in_memory(registry: Arc<Registry>, config: &EngineConfig) -> Self {
        Self::new(
            registry,
            Arc::new(MemoryHistoryStore::new()),
            Arc::new(MemoryTriggerStore::new()),
            config,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.scheduler
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    // ---- flows ----

    pub fn list_flows(&self) -> Vec<FlowSummary> {
        self.registry.list_flows()
    }

    pub async fn get_flow_detail(&self, flow_id: &str) -> EngineResult<FlowDetail> {
        let flow = self.registry.get_flow(flow_id)?.summary();
        let triggers = self.scheduler.list_for_flow(flow_id).await?;
        let counts = self.history.count_by_status(flow_id).await?;
        let recent_executions = self
            .history
            .query(&ExecutionQuery::for_flow(flow_id).page(RECENT_EXECUTIONS, 0))
            .await?;

        Ok(FlowDetail {
            flow,
            triggers,
            counts,
            recent_executions,
        })
    }

    // ---- executions ----

    /// Submit and wait for the terminal state. Unknown flows are an error.
    pub async fn run_flow(&self, flow_id: &str, params: Params) -> EngineResult<Execution> {
        self.submit(flow_id, params).await?.wait().await
    }

    /// Submit without waiting. Unknown flows are an error.
    pub async fn submit(&self, flow_id: &str, params: Params) -> EngineResult<ExecutionHandle> {
        self.registry.get_flow(flow_id)?;
        self.executor.submit_async(flow_id, params).await
    }

    pub async fn get_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        self.executor.get_execution(execution_id).await
    }

    /// One page of executions, most recent first
    pub async fn query_executions(&self, query: &ExecutionQuery) -> EngineResult<Vec<Execution>> {
        self.history.query(query).await
    }

    /// Every execution matching `query`, fetched lazily page by page
    pub fn executions(&self, query: ExecutionQuery) -> BoxStream<'static, EngineResult<Execution>> {
        paginate(Arc::clone(&self.history), query)
    }

    pub async fn execution_logs(&self, execution_id: &str) -> EngineResult<Vec<LogLine>> {
        self.get_execution(execution_id).await?;
        self.history.logs(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> EngineResult<bool> {
        self.executor.cancel(execution_id).await
    }

    // ---- triggers ----

    pub async fn create_trigger(&self, flow_id: &str, cron_expression: &str, params: Params) -> EngineResult<String> {
        self.scheduler.create(flow_id, cron_expression, params).await
    }

    /// Create a trigger carrying a name and description
    pub async fn create_named_trigger(&self, trigger: Trigger) -> EngineResult<Trigger> {
        self.scheduler.create_trigger(trigger).await
    }

    pub async fn enable_trigger(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.scheduler.enable(trigger_id).await
    }

    pub async fn disable_trigger(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.scheduler.disable(trigger_id).await
    }

    pub async fn delete_trigger(&self, trigger_id: &str) -> EngineResult<()> {
        self.scheduler.delete(trigger_id).await
    }

    pub async fn reschedule_trigger(&self, trigger_id: &str, cron_expression: &str) -> EngineResult<Trigger> {
        self.scheduler.reschedule(trigger_id, cron_expression).await
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> EngineResult<Trigger> {
        self.scheduler.get(trigger_id).await
    }

    pub async fn list_triggers(&self) -> EngineResult<Vec<Trigger>> {
        self.scheduler.list().await
    }

    pub async fn trigger_misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>> {
        self.scheduler.misfires(trigger_id).await
    }

    // ---- lifecycle ----

    /// Load stored triggers and start the scheduler loop
    pub async fn start_scheduler(&self) -> EngineResult<JoinHandle<()>> {
        Arc::clone(&self.scheduler).start().await
    }

    /// Stop the scheduler; running executions are left to finish
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::history::ExecutionStatus;
    use serde_json::json;

    fn engine() -> Engine {
        let registry = Registry::new();
        registry
            .register_flow("hello", "Hello", "says hello", |params| async move {
                Ok(json!({ "greeting": format!("hi {}", params.get("name").and_then(|v| v.as_str()).unwrap_or("there")) }))
            })
            .unwrap();
        Engine::in_memory(Arc::new(registry), &EngineConfig::default())
    }

    #[tokio::test]
    async fn direct_calls_reject_unknown_flows() {
        let engine = engine();
        assert_eq!(
            engine.run_flow("nope", Params::new()).await.unwrap_err(),
            EngineError::flow_not_found("nope")
        );
        assert!(engine.get_flow_detail("nope").await.is_err());
        assert!(engine.query_executions(&ExecutionQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flow_detail_counts_executions_and_triggers() {
        let engine = engine();
        let mut params = Params::new();
        params.insert("name".into(), json!("ada"));
        let execution = engine.run_flow("hello", params).await.unwrap();
        assert_eq!(execution.output, Some(json!({"greeting": "hi ada"})));
        engine.create_trigger("hello", "0 9 * * 1-5", Params::new()).await.unwrap();

        let detail = engine.get_flow_detail("hello").await.unwrap();
        assert_eq!(detail.flow.name, "Hello");
        assert_eq!(detail.triggers.len(), 1);
        assert_eq!(detail.counts.succeeded, 1);
        assert_eq!(detail.recent_executions[0].status, ExecutionStatus::Succeeded);

        let logs = engine.execution_logs(&execution.id).await.unwrap();
        assert!(!logs.is_empty());
    }
}
