//! History Store
//!
//! Durable record of flow and task executions. The executor is the only
//! writer for a given execution id; everything else reads. Two backends
//! implement the same [`HistoryStore`] contract:
//! - [`MemoryHistoryStore`] for tests and embedded use
//! - [`SqliteHistoryStore`] backed by an sqlx SQLite pool

pub mod memory;
pub mod sqlite;
pub mod types;

pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;
pub use types::{
    AttemptOutcome, ErrorDetail, Execution, ExecutionOrigin, ExecutionOutcome, ExecutionStatus,
    LogLevel, LogLine, Remark, RemarkLevel, StatusCounts, TaskAttempt, TaskExecution,
};

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Default page size when a query does not set one
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Storage contract for execution history.
///
/// Writes are append-mostly: attempt rows are inserted and only their own
/// RUNNING -> terminal transition mutates them. An execution reaches a
/// terminal status at most once; a second `finalize_execution` returns
/// `Ok(false)` and changes nothing.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a new execution row (normally PENDING)
    async fn create_execution(&self, execution: &Execution) -> EngineResult<()>;

    /// PENDING -> RUNNING. Returns false if the execution was not pending.
    async fn record_execution_start(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Append a RUNNING attempt row
    async fn record_task_attempt(&self, attempt: &TaskAttempt) -> EngineResult<()>;

    /// Move one attempt from RUNNING to its terminal state
    async fn finalize_task(
        &self,
        execution_id: &str,
        seq: u32,
        attempt: u32,
        outcome: &AttemptOutcome,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// Update progress on a running attempt
    async fn update_task_progress(
        &self,
        execution_id: &str,
        seq: u32,
        attempt: u32,
        progress: u8,
        message: Option<&str>,
    ) -> EngineResult<()>;

    /// Write the terminal row. Attempts still RUNNING are failed first so the
    /// task rows always settle before the execution does.
    async fn finalize_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    async fn add_remark(&self, execution_id: &str, remark: &Remark) -> EngineResult<()>;

    async fn append_logs(&self, execution_id: &str, lines: &[LogLine]) -> EngineResult<()>;

    async fn logs(&self, execution_id: &str) -> EngineResult<Vec<LogLine>>;

    async fn get_execution(&self, execution_id: &str) -> EngineResult<Option<Execution>>;

    /// One page of executions, most recent first
    async fn query(&self, query: &ExecutionQuery) -> EngineResult<Vec<Execution>>;

    async fn count_by_status(&self, flow_id: &str) -> EngineResult<StatusCounts>;
}

/// Filters and paging for execution queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on start time
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on start time
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            flow_id: None,
            status: None,
            since: None,
            until: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl ExecutionQuery {
    pub fn for_flow(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: Some(flow_id.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether an execution passes the filters (paging ignored)
    pub fn matches(&self, execution: &Execution) -> bool {
        let at = execution.sort_time();
        self.flow_id.as_deref().map_or(true, |id| execution.flow_id == id)
            && self.status.map_or(true, |s| execution.status == s)
            && self.since.map_or(true, |since| at >= since)
            && self.until.map_or(true, |until| at < until)
    }
}

/// Lazily walk every execution matching `query`, one page at a time.
///
/// Nothing is fetched until the stream is polled, and each page is requested
/// only after the previous one is drained. Calling this again with the same
/// query restarts from `query.offset`.
pub fn paginate(
    store: Arc<dyn HistoryStore>,
    query: ExecutionQuery,
) -> BoxStream<'static, EngineResult<Execution>> {
    let page_size = query.limit.max(1);
    let query = ExecutionQuery {
        limit: page_size,
        ..query
    };

    stream::try_unfold((store, query, false), move |(store, mut query, done)| async move {
        if done {
            return Ok::<_, EngineError>(None);
        }
        let page = store.query(&query).await?;
        let exhausted = (page.len() as u32) < page_size;
        query.offset += page.len() as u32;
        let items = stream::iter(page.into_iter().map(Ok::<Execution, EngineError>));
        Ok(Some((items, (store, query, exhausted))))
    })
    .try_flatten()
    .boxed()
}

/// Stored JSON for an optional value column
pub(crate) fn encode_json(value: &Option<Value>) -> EngineResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(EngineError::from)
}
