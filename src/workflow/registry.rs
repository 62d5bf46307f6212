/// Process-wide registry of task and flow definitions
///
/// Reads are lock-free: each map lives behind an ArcSwap and lookups only load
/// the current snapshot. Writers take a mutex, clone the snapshot, insert and
/// swap, so a duplicate check and its insert can never interleave with another
/// registration.

use crate::error::{DefinitionKind, EngineError, EngineResult};
use crate::workflow::types::{
    FlowDefinition, FlowSummary, Params, TaskDefinition, TaskSummary,
};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

/// Registry of declared tasks and flows, keyed by unique identifiers
#[derive(Debug, Default)]
pub struct Registry {
    /// Key: task name
    tasks: ArcSwap<HashMap<String, Arc<TaskDefinition>>>,
    /// Key: flow id
    flows: ArcSwap<HashMap<String, Arc<FlowDefinition>>>,
    /// Serializes writers so check-then-insert is atomic
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task from an async closure
    pub fn register_task<F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        body: F,
    ) -> EngineResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_task_definition(TaskDefinition::new(name, body).with_description(description))
    }

    /// Register a fully built task definition (e.g. one carrying a retry policy)
    pub fn register_task_definition(&self, task: TaskDefinition) -> EngineResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let current = self.tasks.load();
        if current.contains_key(&task.name) {
            tracing::error!("❌ Duplicate task registration rejected: {}", task.name);
            return Err(EngineError::DuplicateDefinition {
                kind: DefinitionKind::Task,
                id: task.name,
            });
        }

        let mut next = (**current).clone();
        let name = task.name.clone();
        next.insert(name.clone(), Arc::new(task));
        self.tasks.store(Arc::new(next));

        tracing::debug!("📝 Registered task: {}", name);
        Ok(())
    }

    /// Register a flow from an async closure
    pub fn register_flow<F, Fut>(
        &self,
        flow_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        body: F,
    ) -> EngineResult<()>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_flow_definition(
            FlowDefinition::new(flow_id, body)
                .with_name(name)
                .with_description(description),
        )
    }

    /// Register a fully built flow definition
    pub fn register_flow_definition(&self, flow: FlowDefinition) -> EngineResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let current = self.flows.load();
        if current.contains_key(&flow.flow_id) {
            tracing::error!("❌ Duplicate flow registration rejected: {}", flow.flow_id);
            return Err(EngineError::DuplicateDefinition {
                kind: DefinitionKind::Flow,
                id: flow.flow_id,
            });
        }

        let mut next = (**current).clone();
        let flow_id = flow.flow_id.clone();
        next.insert(flow_id.clone(), Arc::new(flow));
        self.flows.store(Arc::new(next));

        tracing::info!("📋 Registered flow: {}", flow_id);
        Ok(())
    }

    /// Remove a flow definition. Triggers bound to it are left alone and fail
    /// at fire time instead.
    pub fn unregister_flow(&self, flow_id: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let current = self.flows.load();
        if !current.contains_key(flow_id) {
            return Err(EngineError::flow_not_found(flow_id));
        }

        let mut next = (**current).clone();
        next.remove(flow_id);
        self.flows.store(Arc::new(next));

        tracing::info!("🗑️ Removed flow from registry: {}", flow_id);
        Ok(())
    }

    /// Get a task by name (lock-free read)
    pub fn get_task(&self, name: &str) -> EngineResult<Arc<TaskDefinition>> {
        self.tasks
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::task_not_found(name))
    }

    /// Get a flow by id (lock-free read)
    pub fn get_flow(&self, flow_id: &str) -> EngineResult<Arc<FlowDefinition>> {
        self.flows
            .load()
            .get(flow_id)
            .cloned()
            .ok_or_else(|| EngineError::flow_not_found(flow_id))
    }

    /// All flows, sorted by id for stable listings
    pub fn list_flows(&self) -> Vec<FlowSummary> {
        let mut flows: Vec<FlowSummary> = self
            .flows
            .load()
            .values()
            .map(|flow| flow.summary())
            .collect();
        flows.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        flows
    }

    /// All tasks, sorted by name
    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        let mut tasks: Vec<TaskSummary> = self
            .tasks
            .load()
            .values()
            .map(|task| TaskSummary {
                name: task.name.clone(),
                display_name: task.display_name.clone(),
                description: task.description.clone(),
                max_retries: task.retry.max_retries,
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_flow_is_rejected_and_original_survives() {
        let registry = Registry::new();
        registry
            .register_flow("f1", "First", "", |_p| async { Ok(json!("original")) })
            .unwrap();

        let err = registry
            .register_flow("f1", "Second", "", |_p| async { Ok(json!("imposter")) })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateDefinition {
                kind: DefinitionKind::Flow,
                ..
            }
        ));

        let flow = registry.get_flow("f1").unwrap();
        assert_eq!(flow.name, "First");
        let out = (flow.body)(Params::new()).await.unwrap();
        assert_eq!(out, json!("original"));
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let registry = Registry::new();
        registry
            .register_task("validate", "", |v| async move { Ok(v) })
            .unwrap();
        let err = registry
            .register_task("validate", "", |v| async move { Ok(v) })
            .unwrap_err();
        assert_eq!(err.kind_name(), "DuplicateDefinition");
        assert_eq!(registry.list_tasks().len(), 1);
    }

    #[test]
    fn lookup_of_unknown_ids_is_not_found() {
        let registry = Registry::new();
        assert_eq!(
            registry.get_flow("nope").unwrap_err(),
            EngineError::flow_not_found("nope")
        );
        assert_eq!(
            registry.get_task("nope").unwrap_err(),
            EngineError::task_not_found("nope")
        );
    }

    #[test]
    fn concurrent_registration_admits_exactly_one_winner() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register_flow("shared", format!("writer-{i}"), "", |_p| async {
                        Ok(Value::Null)
                    })
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.list_flows().len(), 1);
    }

    #[test]
    fn unregister_removes_only_the_flow() {
        let registry = Registry::new();
        registry
            .register_flow("a", "A", "", |_p| async { Ok(Value::Null) })
            .unwrap();
        registry
            .register_flow("b", "B", "", |_p| async { Ok(Value::Null) })
            .unwrap();

        registry.unregister_flow("a").unwrap();
        let ids: Vec<_> = registry.list_flows().into_iter().map(|f| f.flow_id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
        assert!(registry.unregister_flow("a").is_err());
    }
}
