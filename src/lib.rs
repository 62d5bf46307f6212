/// flowrun: workflow execution engine
///
/// Registered tasks composed into flows, executed on demand or on a cron
/// schedule, with every execution and task attempt kept in history.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Definition layer - task/flow definitions and the registry
pub mod workflow;

// Execution history - records, stores and queries
pub mod history;

// Trigger records and their storage
pub mod trigger;

// Runtime - context, executor, cron scheduler and engine facade
pub mod runtime;

// HTTP API layer - REST endpoints over the engine
pub mod api;

// Server setup and initialization
pub mod server;

// Demo flows registered by the binary
pub mod demo;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use history::{Execution, ExecutionQuery, ExecutionStatus};
pub use runtime::{
    add_remark, call_task, current_logger, set_progress, spawn_branch, Engine, ExecutionHandle,
    Executor, TriggerScheduler,
};
pub use server::start_server;
pub use trigger::Trigger;
pub use workflow::{Params, Registry, RetryPolicy, TaskDefinition};
