/// Definition layer
///
/// Task and flow definitions plus the process-wide registry that owns them:
/// - Type definitions (TaskDefinition, FlowDefinition, RetryPolicy)
/// - Lock-free lookup registry using ArcSwap

// Core definition types
pub mod types;

// Registry with duplicate rejection
pub mod registry;

// Re-export commonly used types
pub use registry::Registry;
pub use types::{
    Backoff, FlowDefinition, FlowSummary, Params, RetryPolicy, TaskDefinition, TaskSummary,
};
