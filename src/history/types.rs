/// Execution history records
///
/// An `Execution` is one run of a flow. Task calls inside it are stored as
/// append-only `TaskAttempt` rows and grouped into `TaskExecution`s on read,
/// so every failed attempt stays visible after a retry succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::workflow::Params;

/// Lifecycle of a flow execution or a task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "succeeded" => Some(ExecutionStatus::Succeeded),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured failure: a readable message plus the cause chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error class, e.g. "TaskFailure", "FlowFailure", "NotFound"
    pub kind: String,
    /// Top-level message
    pub message: String,
    /// Cause chain, outermost first
    pub trace: Vec<String>,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: kind.into(),
            trace: vec![message.clone()],
            message,
        }
    }

    /// Capture an `anyhow::Error` including its full source chain
    pub fn from_anyhow(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            kind: kind.into(),
            message: err.to_string(),
            trace: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }
}

/// Who started an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum ExecutionOrigin {
    /// Direct call through the API or library
    Manual,
    /// Fired by the trigger scheduler
    Scheduled {
        trigger_id: String,
        trigger_name: String,
        scheduled_for: DateTime<Utc>,
    },
}

/// Severity of a remark attached to an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemarkLevel {
    Info,
    Warning,
    Error,
}

/// A human note attached to an execution by flow or task code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remark {
    pub level: RemarkLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Log severity for per-execution log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One line written through an execution's logger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Sequence number of the task that logged it, if any
    pub task_seq: Option<u32>,
}

impl LogLine {
    /// `2025-01-31 08:00:00 - INFO - message`
    pub fn format(&self) -> String {
        format!(
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }
}

/// One attempt of one task call. Rows are appended; only `status`, `ended_at`,
/// `output`, `error` and progress change, and only while the row is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub execution_id: String,
    /// Position of the task call within the flow body, from 1
    pub seq: u32,
    /// Attempt number within the call, from 1
    pub attempt: u32,
    pub task_name: String,
    pub input: Value,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub progress: Option<u8>,
    pub progress_message: Option<String>,
}

impl TaskAttempt {
    pub fn running(
        execution_id: &str,
        seq: u32,
        attempt: u32,
        task_name: &str,
        input: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            seq,
            attempt,
            task_name: task_name.to_string(),
            input,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            output: None,
            error: None,
            progress: None,
            progress_message: None,
        }
    }
}

/// Terminal outcome of a task attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(Value),
    Failed(ErrorDetail),
}

/// A task call within an execution with all of its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub seq: u32,
    pub task_name: String,
    /// Every attempt in order; the last one carries the call's final status
    pub attempts: Vec<TaskAttempt>,
}

impl TaskExecution {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn status(&self) -> ExecutionStatus {
        self.attempts
            .last()
            .map(|a| a.status)
            .unwrap_or(ExecutionStatus::Pending)
    }

    pub fn input(&self) -> Option<&Value> {
        self.attempts.first().map(|a| &a.input)
    }

    pub fn output(&self) -> Option<&Value> {
        self.attempts.last().and_then(|a| a.output.as_ref())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.attempts.first().map(|a| a.started_at)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.attempts.last().and_then(|a| a.ended_at)
    }

    /// Group attempt rows (any order) into task executions ordered by seq
    pub fn group(mut attempts: Vec<TaskAttempt>) -> Vec<TaskExecution> {
        attempts.sort_by_key(|a| (a.seq, a.attempt));
        let mut grouped: Vec<TaskExecution> = Vec::new();
        for attempt in attempts {
            match grouped.last_mut() {
                Some(task) if task.seq == attempt.seq => task.attempts.push(attempt),
                _ => grouped.push(TaskExecution {
                    seq: attempt.seq,
                    task_name: attempt.task_name.clone(),
                    attempts: vec![attempt],
                }),
            }
        }
        grouped
    }
}

/// One concrete run of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    pub params: Params,
    pub status: ExecutionStatus,
    pub origin: ExecutionOrigin,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub tasks: Vec<TaskExecution>,
    pub remarks: Vec<Remark>,
}

impl Execution {
    /// New PENDING execution with a fresh id
    pub fn pending(flow_id: &str, params: Params, origin: ExecutionOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            params,
            status: ExecutionStatus::Pending,
            origin,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            tasks: Vec::new(),
            remarks: Vec::new(),
        }
    }

    /// Sort key for "most recent first": start time, falling back to creation
    pub fn sort_time(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Terminal outcome of a flow execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(Value),
    Failed(ErrorDetail),
    Cancelled(ErrorDetail),
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Succeeded(_) => ExecutionStatus::Succeeded,
            ExecutionOutcome::Failed(_) => ExecutionStatus::Failed,
            ExecutionOutcome::Cancelled(_) => ExecutionStatus::Cancelled,
        }
    }
}

/// Per-status execution counts for one flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ExecutionStatus, n: u64) {
        match status {
            ExecutionStatus::Pending => self.pending += n,
            ExecutionStatus::Running => self.running += n,
            ExecutionStatus::Succeeded => self.succeeded += n,
            ExecutionStatus::Failed => self.failed += n,
            ExecutionStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}
