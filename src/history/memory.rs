//! In-memory history store
//!
//! Each execution lives in its own mutex, so writes for one execution id are
//! serialized while different executions never contend beyond the brief map
//! lookup under the outer read lock.

use super::{
    AttemptOutcome, ExecutionQuery, ExecutionStatus, HistoryStore, StatusCounts,
    types::{ErrorDetail, Execution, ExecutionOutcome, LogLine, Remark, TaskAttempt, TaskExecution},
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
struct ExecutionRecord {
    execution: Execution,
    attempts: Vec<TaskAttempt>,
    logs: Vec<LogLine>,
}

impl ExecutionRecord {
    fn snapshot(&self) -> Execution {
        let mut execution = self.execution.clone();
        execution.tasks = TaskExecution::group(self.attempts.clone());
        execution
    }

    fn attempt_mut(&mut self, seq: u32, attempt: u32) -> Option<&mut TaskAttempt> {
        self.attempts
            .iter_mut()
            .find(|a| a.seq == seq && a.attempt == attempt)
    }
}

/// History store keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: RwLock<HashMap<String, Arc<Mutex<ExecutionRecord>>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, execution_id: &str) -> EngineResult<Arc<Mutex<ExecutionRecord>>> {
        self.records
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::execution_not_found(execution_id))
    }

    async fn all_records(&self) -> Vec<Arc<Mutex<ExecutionRecord>>> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_execution(&self, execution: &Execution) -> EngineResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&execution.id) {
            return Err(EngineError::Storage(format!(
                "execution '{}' already exists",
                execution.id
            )));
        }
        let mut execution = execution.clone();
        execution.tasks.clear();
        records.insert(
            execution.id.clone(),
            Arc::new(Mutex::new(ExecutionRecord {
                execution,
                attempts: Vec::new(),
                logs: Vec::new(),
            })),
        );
        Ok(())
    }

    async fn record_execution_start(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let record = self.record(execution_id).await?;
        let mut record = record.lock().await;
        if record.execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }
        record.execution.status = ExecutionStatus::Running;
        record.execution.started_at = Some(started_at);
        Ok(true)
    }

    async fn record_task_attempt(&self, attempt: &TaskAttempt) -> EngineResult<()> {
        let record = self.record(&attempt.execution_id).await?;
        let mut record = record.lock().await;
        if record.execution.status.is_terminal() {
            return Err(EngineError::NoActiveExecution);
        }
        if record.attempt_mut(attempt.seq, attempt.attempt).is_some() {
            return Err(EngineError::Storage(format!(
                "attempt {}#{} already recorded for execution '{}'",
                attempt.seq, attempt.attempt, attempt.execution_id
            )));
        }
        record.attempts.push(attempt.clone());
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
        let record = self.record(execution_id).await?;
        let mut record = record.lock().await;
        let row = record.attempt_mut(seq, attempt).ok_or_else(|| {
            EngineError::Storage(format!(
                "attempt {seq}#{attempt} missing for execution '{execution_id}'"
            ))
        })?;
        if row.status != ExecutionStatus::Running {
            return Ok(());
        }
        row.ended_at = Some(ended_at);
        match outcome {
            AttemptOutcome::Succeeded(output) => {
                row.status = ExecutionStatus::Succeeded;
                row.output = Some(output.clone());
            }
            AttemptOutcome::Failed(error) => {
                row.status = ExecutionStatus::Failed;
                row.error = Some(error.clone());
            }
        }
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
        let record = self.record(execution_id).await?;
        let mut record = record.lock().await;
        if let Some(row) = record.attempt_mut(seq, attempt) {
            if row.status == ExecutionStatus::Running {
                row.progress = Some(progress);
                row.progress_message = message.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn finalize_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let record = self.record(execution_id).await?;
        let mut record = record.lock().await;
        if record.execution.status.is_terminal() {
            return Ok(false);
        }

        for row in record
            .attempts
            .iter_mut()
            .filter(|a| a.status == ExecutionStatus::Running)
        {
            row.status = ExecutionStatus::Failed;
            row.ended_at = Some(ended_at);
            row.error = Some(ErrorDetail::new(
                "Interrupted",
                "execution finished while the task was running",
            ));
        }

        let execution = &mut record.execution;
        execution.status = outcome.status();
        execution.ended_at = Some(ended_at);
        match outcome {
            ExecutionOutcome::Succeeded(output) => execution.output = Some(output.clone()),
            ExecutionOutcome::Failed(error) | ExecutionOutcome::Cancelled(error) => {
                execution.error = Some(error.clone())
            }
        }
        Ok(true)
    }

    async fn add_remark(&self, execution_id: &str, remark: &Remark) -> EngineResult<()> {
        let record = self.record(execution_id).await?;
        record.lock().await.execution.remarks.push(remark.clone());
        Ok(())
    }

    async fn append_logs(&self, execution_id: &str, lines: &[LogLine]) -> EngineResult<()> {
        let record = self.record(execution_id).await?;
        record.lock().await.logs.extend_from_slice(lines);
        Ok(())
    }

    async fn logs(&self, execution_id: &str) -> EngineResult<Vec<LogLine>> {
        let record = self.record(execution_id).await?;
        let logs = record.lock().await.logs.clone();
        Ok(logs)
    }

    async fn get_execution(&self, execution_id: &str) -> EngineResult<Option<Execution>> {
        let record = match self.records.read().await.get(execution_id).cloned() {
            Some(record) => record,
            None => return Ok(None),
        };
        let snapshot = record.lock().await.snapshot();
        Ok(Some(snapshot))
    }

    async fn query(&self, query: &ExecutionQuery) -> EngineResult<Vec<Execution>> {
        let mut matching = Vec::new();
        for record in self.all_records().await {
            let record = record.lock().await;
            if query.matches(&record.execution) {
                matching.push(record.snapshot());
            }
        }

        matching.sort_by(|a, b| {
            b.sort_time()
                .cmp(&a.sort_time())
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn count_by_status(&self, flow_id: &str) -> EngineResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for record in self.all_records().await {
            let record = record.lock().await;
            if record.execution.flow_id == flow_id {
                counts.add(record.execution.status, 1);
            }
        }
        Ok(counts)
    }
}
