/// SQLite persistence for triggers and their misfire log
///
/// Same pool conventions as the history store: JSON text for parameters,
/// integer microseconds for timestamps.

use super::{MisfireEvent, MisfireReason, Trigger, TriggerStore};
use crate::error::{EngineError, EngineResult};
use crate::workflow::Params;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};

/// SQLite-based trigger storage
#[derive(Debug, Clone)]
pub struct SqliteTriggerStore {
    pool: SqlitePool,
}

impl SqliteTriggerStore {
    /// Create new store over an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the trigger tables
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                cron_expression TEXT NOT NULL,
                params JSON NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_fired_at INTEGER,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trigger_misfires (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_id TEXT NOT NULL,
                scheduled_for INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                reason TEXT NOT NULL,
                blocking_execution_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_triggers_flow ON triggers(flow_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl TriggerStore for SqliteTriggerStore {
    async fn insert(&self, trigger: &Trigger) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO triggers (id, flow_id, name, description, cron_expression, params, enabled,
                                  created_at, updated_at, last_fired_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trigger.id)
        .bind(&trigger.flow_id)
        .bind(&trigger.name)
        .bind(&trigger.description)
        .bind(&trigger.cron_expression)
        .bind(serde_json::to_string(&trigger.params)?)
        .bind(trigger.enabled)
        .bind(trigger.created_at.timestamp_micros())
        .bind(trigger.updated_at.timestamp_micros())
        .bind(trigger.last_fired_at.map(|t| t.timestamp_micros()))
        .bind(&trigger.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, trigger: &Trigger) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET flow_id = ?, name = ?, description = ?, cron_expression = ?,
                params = ?, enabled = ?, updated_at = ?, last_fired_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(&trigger.flow_id)
        .bind(&trigger.name)
        .bind(&trigger.description)
        .bind(&trigger.cron_expression)
        .bind(serde_json::to_string(&trigger.params)?)
        .bind(trigger.enabled)
        .bind(trigger.updated_at.timestamp_micros())
        .bind(trigger.last_fired_at.map(|t| t.timestamp_micros()))
        .bind(&trigger.last_error)
        .bind(&trigger.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::trigger_not_found(&trigger.id));
        }
        Ok(())
    }

    async fn mark_fired(&self, trigger_id: &str, fired_at: DateTime<Utc>) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE triggers SET last_fired_at = ?, last_error = NULL WHERE id = ?",
        )
        .bind(fired_at.timestamp_micros())
        .bind(trigger_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::trigger_not_found(trigger_id));
        }
        Ok(())
    }

    async fn set_last_error(&self, trigger_id: &str, error: Option<&str>) -> EngineResult<()> {
        let result = sqlx::query("UPDATE triggers SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::trigger_not_found(trigger_id));
        }
        Ok(())
    }

    async fn get(&self, trigger_id: &str) -> EngineResult<Option<Trigger>> {
        let row = sqlx::query(&format!("{TRIGGER_COLUMNS} WHERE id = ?"))
            .bind(trigger_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn list(&self) -> EngineResult<Vec<Trigger>> {
        let rows = sqlx::query(&format!("{TRIGGER_COLUMNS} ORDER BY created_at, id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn list_for_flow(&self, flow_id: &str) -> EngineResult<Vec<Trigger>> {
        let rows = sqlx::query(&format!(
            "{TRIGGER_COLUMNS} WHERE flow_id = ? ORDER BY created_at, id"
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trigger_from_row).collect()
    }

    async fn delete(&self, trigger_id: &str) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM triggers WHERE id = ?")
            .bind(trigger_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(EngineError::trigger_not_found(trigger_id));
        }

        sqlx::query("DELETE FROM trigger_misfires WHERE trigger_id = ?")
            .bind(trigger_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_misfire(&self, event: &MisfireEvent) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trigger_misfires (trigger_id, scheduled_for, recorded_at, reason, blocking_execution_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.trigger_id)
        .bind(event.scheduled_for.timestamp_micros())
        .bind(event.recorded_at.timestamp_micros())
        .bind(event.reason.as_str())
        .bind(&event.blocking_execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn misfires(&self, trigger_id: &str) -> EngineResult<Vec<MisfireEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_id, scheduled_for, recorded_at, reason, blocking_execution_id
            FROM trigger_misfires WHERE trigger_id = ? ORDER BY id
            "#,
        )
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let reason: String = row.try_get("reason")?;
                Ok(MisfireEvent {
                    trigger_id: row.try_get("trigger_id")?,
                    scheduled_for: from_micros(row.try_get("scheduled_for")?)?,
                    recorded_at: from_micros(row.try_get("recorded_at")?)?,
                    reason: MisfireReason::parse(&reason).ok_or_else(|| {
                        EngineError::Storage(format!("unknown misfire reason '{reason}'"))
                    })?,
                    blocking_execution_id: row.try_get("blocking_execution_id")?,
                })
            })
            .collect()
    }
}

const TRIGGER_COLUMNS: &str = "SELECT id, flow_id, name, description, cron_expression, params, enabled, created_at, updated_at, last_fired_at, last_error FROM triggers";

fn trigger_from_row(row: &SqliteRow) -> EngineResult<Trigger> {
    let params: String = row.try_get("params")?;
    let last_fired_at: Option<i64> = row.try_get("last_fired_at")?;

    Ok(Trigger {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        cron_expression: row.try_get("cron_expression")?,
        params: serde_json::from_str::<Params>(&params)?,
        enabled: row.try_get("enabled")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
        last_fired_at: last_fired_at.map(from_micros).transpose()?,
        last_error: row.try_get("last_error")?,
    })
}

fn from_micros(micros: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EngineError::Storage(format!("timestamp out of range: {micros}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteTriggerStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteTriggerStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn trigger_round_trips_through_sqlite() {
        let store = store().await;
        let mut params = Params::new();
        params.insert("region".into(), json!("eu"));
        let trigger = Trigger::new("report", "0 2 * * *", params)
            .with_name("nightly report")
            .with_description("runs at two");
        store.insert(&trigger).await.unwrap();

        let mut stored = store.get(&trigger.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "nightly report");
        assert_eq!(stored.params.get("region"), Some(&json!("eu")));
        assert!(stored.enabled);

        stored.enabled = false;
        stored.cron_expression = "30 3 * * *".into();
        store.update(&stored).await.unwrap();
        let reloaded = store.get(&trigger.id).await.unwrap().unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.cron_expression, "30 3 * * *");
        assert_eq!(store.list_for_flow("report").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_fired_keeps_a_concurrent_disable() {
        let store = store().await;
        let trigger = Trigger::new("f1", "*/5 * * * *", Params::new());
        store.insert(&trigger).await.unwrap();
        store.set_last_error(&trigger.id, Some("flow missing")).await.unwrap();

        let mut disabled = store.get(&trigger.id).await.unwrap().unwrap();
        disabled.enabled = false;
        disabled.cron_expression = "0 * * * *".into();
        store.update(&disabled).await.unwrap();

        let fired_at = DateTime::from_timestamp_micros(1_767_225_600_000_000).unwrap();
        store.mark_fired(&trigger.id, fired_at).await.unwrap();

        let stored = store.get(&trigger.id).await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.cron_expression, "0 * * * *");
        assert_eq!(stored.last_fired_at, Some(fired_at));
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn delete_removes_misfire_log() {
        let store = store().await;
        let trigger = Trigger::new("f1", "* * * * *", Params::new());
        store.insert(&trigger).await.unwrap();
        store
            .record_misfire(&MisfireEvent::new(&trigger.id, Utc::now(), MisfireReason::StillRunning))
            .await
            .unwrap();
        assert_eq!(store.misfires(&trigger.id).await.unwrap().len(), 1);

        store.delete(&trigger.id).await.unwrap();
        assert!(store.misfires(&trigger.id).await.unwrap().is_empty());
        assert_eq!(
            store.delete(&trigger.id).await.unwrap_err(),
            EngineError::trigger_not_found(&trigger.id)
        );
    }
}
