/// Runtime Execution Engine
///
/// This module runs flows and fires triggers. It handles:
/// - Per-execution context available to nested task calls
/// - Task interception with retries and attempt history
/// - FIFO admission under a concurrency ceiling
/// - Cron trigger evaluation and coalescing

// Task-local execution context
pub mod context;

// Per-execution logger
pub mod logger;

// Flow execution and task interception
pub mod executor;

// Five-field cron parsing
pub mod cron;

// Trigger scheduler
pub mod scheduler;

// Engine facade used by the API layer
pub mod engine;

// Re-export main types
pub use context::{
    add_remark, current_execution_id, current_logger, is_cancelled, set_progress, spawn_branch,
};
pub use cron::CronSchedule;
pub use engine::{Engine, FlowDetail};
pub use executor::{call_task, ExecutionHandle, Executor};
pub use logger::FlowLogger;
pub use scheduler::{FiredTrigger, SchedulerConfig, TickReport, TriggerScheduler};
