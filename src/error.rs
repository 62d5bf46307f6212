//! Engine error taxonomy
//!
//! Every failure the core can surface to a caller. Body code returns
//! `anyhow::Result`, so these convert into `anyhow::Error` with `?` and can be
//! recovered again with `downcast_ref::<EngineError>()`.

/// Errors raised by the registry, executor, scheduler and stores
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// An identifier was registered twice
    #[error("{kind} '{id}' is already registered")]
    DuplicateDefinition { kind: DefinitionKind, id: String },

    /// Unknown flow, task, trigger or execution id
    #[error("{kind} '{id}' not found")]
    NotFound { kind: DefinitionKind, id: String },

    /// A task body kept failing after all retries
    #[error("task '{task}' failed after {attempts} attempt(s): {message}")]
    TaskFailure {
        task: String,
        attempts: u32,
        message: String,
    },

    /// The flow body returned an error that nothing recovered
    #[error("flow '{flow_id}' failed: {message}")]
    FlowFailure { flow_id: String, message: String },

    /// Execution context accessed outside of a running execution
    #[error("no active execution in the current task")]
    NoActiveExecution,

    /// Trigger was due while its previous fire was still running
    #[error("trigger '{trigger_id}' misfired: {reason}")]
    SchedulerMisfire { trigger_id: String, reason: String },

    /// Cron expression could not be parsed
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Cancellation was requested for the running execution
    #[error("execution cancelled")]
    Cancelled,

    /// Persistence layer failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// What kind of identifier an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Task,
    Flow,
    Trigger,
    Execution,
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionKind::Task => write!(f, "task"),
            DefinitionKind::Flow => write!(f, "flow"),
            DefinitionKind::Trigger => write!(f, "trigger"),
            DefinitionKind::Execution => write!(f, "execution"),
        }
    }
}

impl EngineError {
    pub fn flow_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: DefinitionKind::Flow,
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: DefinitionKind::Task,
            id: id.into(),
        }
    }

    pub fn trigger_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: DefinitionKind::Trigger,
            id: id.into(),
        }
    }

    pub fn execution_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: DefinitionKind::Execution,
            id: id.into(),
        }
    }

    /// Short machine-readable name, stored as `ErrorDetail::kind`
    pub fn kind_name(&self) -> &'static str {
        match self {
            EngineError::DuplicateDefinition { .. } => "DuplicateDefinition",
            EngineError::NotFound { .. } => "NotFound",
            EngineError::TaskFailure { .. } => "TaskFailure",
            EngineError::FlowFailure { .. } => "FlowFailure",
            EngineError::NoActiveExecution => "NoActiveExecution",
            EngineError::SchedulerMisfire { .. } => "SchedulerMisfire",
            EngineError::InvalidCron { .. } => "InvalidCron",
            EngineError::Cancelled => "Cancelled",
            EngineError::Storage(_) => "Storage",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {e}"))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_kind() {
        let err = EngineError::flow_not_found("f1");
        assert_eq!(err.to_string(), "flow 'f1' not found");
        assert_eq!(err.kind_name(), "NotFound");
    }

    #[test]
    fn engine_error_survives_anyhow_round_trip() {
        let err: anyhow::Error = EngineError::Cancelled.into();
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::Cancelled));
    }
}
