/// SQLite persistence layer for execution history
///
/// Executions, task attempts, remarks and log lines each get a table.
/// Structured values are stored as JSON text; timestamps as integer
/// microseconds so ordering by time is a plain integer comparison.

use super::{
    encode_json, AttemptOutcome, ExecutionQuery, ExecutionStatus, HistoryStore, StatusCounts,
    types::{
        ErrorDetail, Execution, ExecutionOrigin, ExecutionOutcome, LogLevel, LogLine, Remark,
        RemarkLevel, TaskAttempt, TaskExecution,
    },
};
use crate::error::{EngineError, EngineResult};
use crate::workflow::Params;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite,
};

/// Rows per multi-row log INSERT; five binds each keeps a statement well
/// under SQLite's bound-parameter limit
const LOG_INSERT_BATCH: usize = 100;

/// SQLite-based history store
///
/// Writes for one execution arrive in order from its executor task; SQLite
/// serializes writers, so rows of concurrent executions never mix.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    /// SQLite connection pool for the history database
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Create new store instance with an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Private in-memory database, one connection so every query sees it
    pub async fn in_memory() -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the history schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                params JSON NOT NULL,
                status TEXT NOT NULL,
                origin JSON NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                output JSON,
                error JSON
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_attempts (
                execution_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                input JSON NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                output JSON,
                error JSON,
                progress INTEGER,
                progress_message TEXT,
                PRIMARY KEY (execution_id, seq, attempt)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_remarks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                task_seq INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes for the common history filters
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_flow_started ON executions(flow_id, started_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_attempts(&self, execution_id: &str) -> EngineResult<Vec<TaskAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, seq, attempt, task_name, input, status, started_at, ended_at,
                   output, error, progress, progress_message
            FROM task_attempts WHERE execution_id = ? ORDER BY seq, attempt
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn load_remarks(&self, execution_id: &str) -> EngineResult<Vec<Remark>> {
        let rows = sqlx::query(
            "SELECT level, message, created_at FROM execution_remarks WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                Ok(Remark {
                    level: parse_remark_level(&level),
                    message: row.try_get("message")?,
                    created_at: from_micros(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> EngineResult<Execution> {
        let mut execution = execution_from_row(row)?;
        execution.tasks = TaskExecution::group(self.load_attempts(&execution.id).await?);
        execution.remarks = self.load_remarks(&execution.id).await?;
        Ok(execution)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn create_execution(&self, execution: &Execution) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, flow_id, params, status, origin, created_at, started_at, ended_at, output, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.flow_id)
        .bind(to_json(&execution.params)?)
        .bind(execution.status.as_str())
        .bind(to_json(&execution.origin)?)
        .bind(execution.created_at.timestamp_micros())
        .bind(execution.started_at.map(|t| t.timestamp_micros()))
        .bind(execution.ended_at.map(|t| t.timestamp_micros()))
        .bind(encode_json(&execution.output)?)
        .bind(execution.error.as_ref().map(to_json).transpose()?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_execution_start(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(started_at.timestamp_micros())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(execution_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_task_attempt(&self, attempt: &TaskAttempt) -> EngineResult<()> {
        // Only while the parent is still open; a terminal execution takes no new rows
        let result = sqlx::query(
            r#"
            INSERT INTO task_attempts (execution_id, seq, attempt, task_name, input, status, started_at)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM executions WHERE id = ? AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(&attempt.execution_id)
        .bind(attempt.seq as i64)
        .bind(attempt.attempt as i64)
        .bind(&attempt.task_name)
        .bind(to_json(&attempt.input)?)
        .bind(attempt.status.as_str())
        .bind(attempt.started_at.timestamp_micros())
        .bind(&attempt.execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(&attempt.execution_id).await?;
            return Err(EngineError::NoActiveExecution);
        }
        Ok(())
    }

    async fn finalize_task(
        &self,
        execution_id: &str,
        seq: u32,
        attempt: u32,
        outcome: &AttemptOutcome,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let (status, output, error) = match outcome {
            AttemptOutcome::Succeeded(output) => {
                (ExecutionStatus::Succeeded, Some(to_json(output)?), None)
            }
            AttemptOutcome::Failed(error) => (ExecutionStatus::Failed, None, Some(to_json(error)?)),
        };

        sqlx::query(
            r#"
            UPDATE task_attempts SET status = ?, ended_at = ?, output = ?, error = ?
            WHERE execution_id = ? AND seq = ? AND attempt = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at.timestamp_micros())
        .bind(output)
        .bind(error)
        .bind(execution_id)
        .bind(seq as i64)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_task_progress(
        &self,
        execution_id: &str,
        seq: u32,
        attempt: u32,
        progress: u8,
        message: Option<&str>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE task_attempts SET progress = ?, progress_message = ?
            WHERE execution_id = ? AND seq = ? AND attempt = ? AND status = 'running'
            "#,
        )
        .bind(progress as i64)
        .bind(message)
        .bind(execution_id)
        .bind(seq as i64)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let (output, error) = match outcome {
            ExecutionOutcome::Succeeded(output) => (Some(to_json(output)?), None),
            ExecutionOutcome::Failed(error) | ExecutionOutcome::Cancelled(error) => {
                (None, Some(to_json(error)?))
            }
        };
        let interrupted = to_json(&ErrorDetail::new(
            "Interrupted",
            "execution finished while the task was running",
        ))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE task_attempts SET status = 'failed', ended_at = ?, error = ?
            WHERE execution_id = ? AND status = 'running'
            "#,
        )
        .bind(ended_at.timestamp_micros())
        .bind(interrupted)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE executions SET status = ?, ended_at = ?, output = ?, error = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(outcome.status().as_str())
        .bind(ended_at.timestamp_micros())
        .bind(output)
        .bind(error)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            self.ensure_exists(execution_id).await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn add_remark(&self, execution_id: &str, remark: &Remark) -> EngineResult<()> {
        self.ensure_exists(execution_id).await?;
        sqlx::query(
            "INSERT INTO execution_remarks (execution_id, level, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(execution_id)
        .bind(remark_level_str(remark.level))
        .bind(&remark.message)
        .bind(remark.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_logs(&self, execution_id: &str, lines: &[LogLine]) -> EngineResult<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in lines.chunks(LOG_INSERT_BATCH) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO execution_logs (execution_id, timestamp, level, message, task_seq) ",
            );
            builder.push_values(chunk, |mut b, line| {
                b.push_bind(execution_id)
                    .push_bind(line.timestamp.timestamp_micros())
                    .push_bind(line.level.as_str())
                    .push_bind(&line.message)
                    .push_bind(line.task_seq.map(|s| s as i64));
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn logs(&self, execution_id: &str) -> EngineResult<Vec<LogLine>> {
        let rows = sqlx::query(
            "SELECT timestamp, level, message, task_seq FROM execution_logs WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("level")?;
                let task_seq: Option<i64> = row.try_get("task_seq")?;
                Ok(LogLine {
                    timestamp: from_micros(row.try_get("timestamp")?)?,
                    level: parse_log_level(&level),
                    message: row.try_get("message")?,
                    task_seq: task_seq.map(|s| s as u32),
                })
            })
            .collect()
    }

    async fn get_execution(&self, execution_id: &str) -> EngineResult<Option<Execution>> {
        let row = sqlx::query(&format!("{EXECUTION_COLUMNS} WHERE id = ?"))
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn query(&self, query: &ExecutionQuery) -> EngineResult<Vec<Execution>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("{EXECUTION_COLUMNS} WHERE 1 = 1"));

        if let Some(flow_id) = &query.flow_id {
            builder.push(" AND flow_id = ").push_bind(flow_id.clone());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = query.since {
            builder
                .push(" AND COALESCE(started_at, created_at) >= ")
                .push_bind(since.timestamp_micros());
        }
        if let Some(until) = query.until {
            builder
                .push(" AND COALESCE(started_at, created_at) < ")
                .push_bind(until.timestamp_micros());
        }
        builder
            .push(" ORDER BY COALESCE(started_at, created_at) DESC, created_at DESC, id DESC")
            .push(" LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            executions.push(self.hydrate(row).await?);
        }
        Ok(executions)
    }

    async fn count_by_status(&self, flow_id: &str) -> EngineResult<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM executions WHERE flow_id = ? GROUP BY status",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = ExecutionStatus::parse(&status) {
                counts.add(status, n as u64);
            }
        }
        Ok(counts)
    }
}

impl SqliteHistoryStore {
    async fn ensure_exists(&self, execution_id: &str) -> EngineResult<()> {
        let found = sqlx::query("SELECT 1 FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(EngineError::execution_not_found(execution_id)),
        }
    }
}

const EXECUTION_COLUMNS: &str = "SELECT id, flow_id, params, status, origin, created_at, started_at, ended_at, output, error FROM executions";

fn execution_from_row(row: &SqliteRow) -> EngineResult<Execution> {
    let status: String = row.try_get("status")?;
    let params: String = row.try_get("params")?;
    let origin: String = row.try_get("origin")?;
    let output: Option<String> = row.try_get("output")?;
    let error: Option<String> = row.try_get("error")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let ended_at: Option<i64> = row.try_get("ended_at")?;

    Ok(Execution {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        params: from_json_str::<Params>(&params)?,
        status: parse_status(&status)?,
        origin: from_json_str::<ExecutionOrigin>(&origin)?,
        created_at: from_micros(row.try_get("created_at")?)?,
        started_at: started_at.map(from_micros).transpose()?,
        ended_at: ended_at.map(from_micros).transpose()?,
        output: output.as_deref().map(from_json_str).transpose()?,
        error: error.as_deref().map(from_json_str).transpose()?,
        tasks: Vec::new(),
        remarks: Vec::new(),
    })
}

fn attempt_from_row(row: &SqliteRow) -> EngineResult<TaskAttempt> {
    let status: String = row.try_get("status")?;
    let input: String = row.try_get("input")?;
    let output: Option<String> = row.try_get("output")?;
    let error: Option<String> = row.try_get("error")?;
    let ended_at: Option<i64> = row.try_get("ended_at")?;
    let progress: Option<i64> = row.try_get("progress")?;
    let seq: i64 = row.try_get("seq")?;
    let attempt: i64 = row.try_get("attempt")?;

    Ok(TaskAttempt {
        execution_id: row.try_get("execution_id")?,
        seq: seq as u32,
        attempt: attempt as u32,
        task_name: row.try_get("task_name")?,
        input: from_json_str(&input)?,
        status: parse_status(&status)?,
        started_at: from_micros(row.try_get("started_at")?)?,
        ended_at: ended_at.map(from_micros).transpose()?,
        output: output.as_deref().map(from_json_str).transpose()?,
        error: error.as_deref().map(from_json_str).transpose()?,
        progress: progress.map(|p| p.clamp(0, 100) as u8),
        progress_message: row.try_get("progress_message")?,
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> EngineResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json_str<T: DeserializeOwned>(s: &str) -> EngineResult<T> {
    Ok(serde_json::from_str(s)?)
}

fn from_micros(micros: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EngineError::Storage(format!("timestamp out of range: {micros}")))
}

fn parse_status(s: &str) -> EngineResult<ExecutionStatus> {
    ExecutionStatus::parse(s).ok_or_else(|| EngineError::Storage(format!("unknown status '{s}'")))
}

fn parse_log_level(s: &str) -> LogLevel {
    match s {
        "DEBUG" => LogLevel::Debug,
        "WARN" => LogLevel::Warn,
        "ERROR" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn parse_remark_level(s: &str) -> RemarkLevel {
    match s {
        "warning" => RemarkLevel::Warning,
        "error" => RemarkLevel::Error,
        _ => RemarkLevel::Info,
    }
}

fn remark_level_str(level: RemarkLevel) -> &'static str {
    match level {
        RemarkLevel::Info => "info",
        RemarkLevel::Warning => "warning",
        RemarkLevel::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn execution_round_trips_with_attempts_and_remarks() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let mut params = Params::new();
        params.insert("age".into(), json!(5));
        let execution = Execution::pending("f1", params.clone(), ExecutionOrigin::Manual);
        store.create_execution(&execution).await.unwrap();
        assert!(store.record_execution_start(&execution.id, Utc::now()).await.unwrap());

        let attempt = TaskAttempt::running(&execution.id, 1, 1, "validate", json!({"age": 5}));
        store.record_task_attempt(&attempt).await.unwrap();
        store
            .update_task_progress(&execution.id, 1, 1, 50, Some("halfway"))
            .await
            .unwrap();
        store
            .finalize_task(
                &execution.id,
                1,
                1,
                &AttemptOutcome::Succeeded(json!({"age": 5})),
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .add_remark(
                &execution.id,
                &Remark {
                    level: RemarkLevel::Warning,
                    message: "large batch".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(store
            .finalize_execution(&execution.id, &ExecutionOutcome::Succeeded(json!({"ok": true})), Utc::now())
            .await
            .unwrap());

        let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        assert_eq!(stored.params, params);
        assert_eq!(stored.output, Some(json!({"ok": true})));
        assert_eq!(stored.tasks.len(), 1);
        assert_eq!(stored.tasks[0].status(), ExecutionStatus::Succeeded);
        assert_eq!(stored.tasks[0].attempts[0].progress, Some(50));
        assert_eq!(stored.remarks[0].level, RemarkLevel::Warning);
    }

    #[tokio::test]
    async fn second_finalize_is_ignored() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let execution = Execution::pending("f1", Params::new(), ExecutionOrigin::Manual);
        store.create_execution(&execution).await.unwrap();

        let failed = ExecutionOutcome::Failed(ErrorDetail::new("FlowFailure", "boom"));
        assert!(store.finalize_execution(&execution.id, &failed, Utc::now()).await.unwrap());
        assert!(!store
            .finalize_execution(&execution.id, &ExecutionOutcome::Succeeded(json!(1)), Utc::now())
            .await
            .unwrap());

        let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn logs_keep_insertion_order() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let execution = Execution::pending("f1", Params::new(), ExecutionOrigin::Manual);
        store.create_execution(&execution).await.unwrap();

        let lines: Vec<LogLine> = ["one", "two", "three"]
            .iter()
            .map(|m| LogLine {
                timestamp: Utc::now(),
                level: LogLevel::Info,
                message: m.to_string(),
                task_seq: Some(1),
            })
            .collect();
        store.append_logs(&execution.id, &lines).await.unwrap();

        let stored = store.logs(&execution.id).await.unwrap();
        let messages: Vec<_> = stored.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn large_log_flush_is_stored_in_full() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let execution = Execution::pending("f1", Params::new(), ExecutionOrigin::Manual);
        store.create_execution(&execution).await.unwrap();

        let lines: Vec<LogLine> = (0..7_500)
            .map(|i| LogLine {
                timestamp: Utc::now(),
                level: LogLevel::Debug,
                message: format!("row {i}"),
                task_seq: None,
            })
            .collect();
        store.append_logs(&execution.id, &lines).await.unwrap();

        let stored = store.logs(&execution.id).await.unwrap();
        assert_eq!(stored.len(), 7_500);
        assert_eq!(stored[0].message, "row 0");
        assert_eq!(stored[7_499].message, "row 7499");
    }

    #[tokio::test]
    async fn terminal_execution_rejects_new_attempts() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        let execution = Execution::pending("f1", Params::new(), ExecutionOrigin::Manual);
        store.create_execution(&execution).await.unwrap();
        store
            .finalize_execution(&execution.id, &ExecutionOutcome::Succeeded(json!(null)), Utc::now())
            .await
            .unwrap();

        let late = TaskAttempt::running(&execution.id, 1, 1, "late", json!(null));
        assert_eq!(
            store.record_task_attempt(&late).await.unwrap_err(),
            EngineError::NoActiveExecution
        );
        let orphan = TaskAttempt::running("missing", 1, 1, "late", json!(null));
        assert_eq!(
            store.record_task_attempt(&orphan).await.unwrap_err(),
            EngineError::execution_not_found("missing")
        );
        let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert!(stored.tasks.is_empty());
    }

    #[tokio::test]
    async fn query_filters_by_status_and_counts() {
        let store = SqliteHistoryStore::in_memory().await.unwrap();
        for i in 0..4 {
            let execution = Execution::pending("f1", Params::new(), ExecutionOrigin::Manual);
            store.create_execution(&execution).await.unwrap();
            if i % 2 == 0 {
                store
                    .finalize_execution(&execution.id, &ExecutionOutcome::Succeeded(json!(i)), Utc::now())
                    .await
                    .unwrap();
            }
        }

        let succeeded = store
            .query(&ExecutionQuery::for_flow("f1").with_status(ExecutionStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 2);

        let counts = store.count_by_status("f1").await.unwrap();
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.total(), 4);
    }
}
