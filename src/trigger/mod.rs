//! Trigger storage
//!
//! Trigger rows and their misfire log. The scheduler owns all mutation; the
//! store only needs insert, update-by-id, lookup and delete.

pub mod sqlite;
pub mod types;

pub use sqlite::SqliteTriggerStore;
pub use types::{MisfireEvent, MisfireReason, Trigger};

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence contract for triggers
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Insert a new trigger; fails if the id exists
    async fn insert(&self, trigger: &Trigger) -> EngineResult<()>;

    /// Replace a stored trigger by id
    async fn update(&self, trigger: &Trigger) -> EngineResult<()>;

    /// Record a fire: sets `last_fired_at` and clears `last_error`, leaving
    /// every other column as currently stored
    async fn mark_fired(&self, trigger_id: &str, fired_at: DateTime<Utc>) -> EngineResult<()>;

    /// Set or clear `last_error` only
    async fn set_last_error(&self, trigger_id: &str, error: Option<&str>) -> EngineResult<()>;

    async fn get(&self, trigger_id: &str) -> EngineResult<Option<Trigger>>;

    /// All triggers ordered by creation time
    async fn list(&self) -> EngineResult<Vec<Trigger>>;

    /// Remove a trigger and its misfire log
    async fn delete(&self, trigger_id: &str) -> EngineResult<()>;

    async fn record_misfire(&self, event: &MisfireEvent) -> EngineResult<()>;

    /// Misfires of one trigger, oldest first
    async fn misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>>;

    /// Triggers bound to one flow
    async fn list_for_flow(&self, flow_id: &str) -> EngineResult<Vec<Trigger>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.flow_id == flow_id)
            .collect())
    }
}

/// Trigger store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryTriggerStore {
    triggers: RwLock<HashMap<String, Trigger>>,
    misfires: RwLock<HashMap<String, Vec<MisfireEvent>>>,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn insert(&self, trigger: &Trigger) -> EngineResult<()> {
        let mut triggers = self.triggers.write().await;
        if triggers.contains_key(&trigger.id) {
            return Err(EngineError::Storage(format!(
                "trigger '{}' already exists",
                trigger.id
            )));
        }
        triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn update(&self, trigger: &Trigger) -> EngineResult<()> {
        let mut triggers = self.triggers.write().await;
        match triggers.get_mut(&trigger.id) {
            Some(stored) => {
                *stored = trigger.clone();
                Ok(())
            }
            None => Err(EngineError::trigger_not_found(&trigger.id)),
        }
    }

    async fn mark_fired(&self, trigger_id: &str, fired_at: DateTime<Utc>) -> EngineResult<()> {
        let mut triggers = self.triggers.write().await;
        let stored = triggers
            .get_mut(trigger_id)
            .ok_or_else(|| EngineError::trigger_not_found(trigger_id))?;
        stored.last_fired_at = Some(fired_at);
        stored.last_error = None;
        Ok(())
    }

    async fn set_last_error(&self, trigger_id: &str, error: Option<&str>) -> EngineResult<()> {
        let mut triggers = self.triggers.write().await;
        let stored = triggers
            .get_mut(trigger_id)
            .ok_or_else(|| EngineError::trigger_not_found(trigger_id))?;
        stored.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn get(&self, trigger_id: &str) -> EngineResult<Option<Trigger>> {
        Ok(self.triggers.read().await.get(trigger_id).cloned())
    }

    async fn list(&self) -> EngineResult<Vec<Trigger>> {
        let mut triggers: Vec<Trigger> = self.triggers.read().await.values().cloned().collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(triggers)
    }

    async fn delete(&self, trigger_id: &str) -> EngineResult<()> {
        if self.triggers.write().await.remove(trigger_id).is_none() {
            return Err(EngineError::trigger_not_found(trigger_id));
        }
        self.misfires.write().await.remove(trigger_id);
        Ok(())
    }

    async fn record_misfire(&self, event: &MisfireEvent) -> EngineResult<()> {
        self.misfires
            .write()
            .await
            .entry(event.trigger_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>> {
        Ok(self
            .misfires
            .read()
            .await
            .get(trigger_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Params;

    #[tokio::test]
    async fn update_and_delete_require_existing_trigger() {
        let store = MemoryTriggerStore::new();
        let trigger = Trigger::new("f1", "0 2 * * *", Params::new());

        assert_eq!(
            store.update(&trigger).await.unwrap_err(),
            EngineError::trigger_not_found(&trigger.id)
        );

        store.insert(&trigger).await.unwrap();
        assert!(store.insert(&trigger).await.is_err());

        let mut disabled = trigger.clone();
        disabled.enabled = false;
        store.update(&disabled).await.unwrap();
        assert!(!store.get(&trigger.id).await.unwrap().unwrap().enabled);

        store.delete(&trigger.id).await.unwrap();
        assert!(store.get(&trigger.id).await.unwrap().is_none());
        assert!(store.delete(&trigger.id).await.is_err());
    }

    #[tokio::test]
    async fn fire_bookkeeping_leaves_other_columns_alone() {
        let store = MemoryTriggerStore::new();
        let trigger = Trigger::new("f1", "* * * * *", Params::new());
        store.insert(&trigger).await.unwrap();

        // a disable lands after the scheduler read the row
        let mut disabled = trigger.clone();
        disabled.enabled = false;
        store.update(&disabled).await.unwrap();

        store.set_last_error(&trigger.id, Some("boom")).await.unwrap();
        let fired_at = Utc::now();
        store.mark_fired(&trigger.id, fired_at).await.unwrap();

        let stored = store.get(&trigger.id).await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.last_fired_at, Some(fired_at));
        assert_eq!(stored.last_error, None);
        assert_eq!(
            store.mark_fired("missing", fired_at).await.unwrap_err(),
            EngineError::trigger_not_found("missing")
        );
    }

    #[tokio::test]
    async fn list_for_flow_filters_by_flow_id() {
        let store = MemoryTriggerStore::new();
        store.insert(&Trigger::new("a", "* * * * *", Params::new())).await.unwrap();
        store.insert(&Trigger::new("b", "* * * * *", Params::new())).await.unwrap();
        store.insert(&Trigger::new("a", "0 * * * *", Params::new())).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 3);
        assert_eq!(store.list_for_flow("a").await.unwrap().len(), 2);
    }
}
