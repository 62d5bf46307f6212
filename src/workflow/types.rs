/// Core definition types for tasks and flows
///
/// Tasks and flows are plain values holding a first-class callable body.
/// Inputs and outputs are `serde_json::Value` so history rows and the HTTP
/// adapter can store and ship them without any extra conversion.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, future::Future, sync::Arc, time::Duration};

/// Flow call parameters (structured key -> value)
pub type Params = Map<String, Value>;

/// Future returned by every task or flow body
pub type BodyFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Task body: one input value in, one output value out
pub type TaskBody = Arc<dyn Fn(Value) -> BodyFuture + Send + Sync>;

/// Flow body: call parameters in, flow result out
pub type FlowBody = Arc<dyn Fn(Params) -> BodyFuture + Send + Sync>;

/// A registered unit of work
///
/// Immutable once handed to the registry. The `name` is the global identity;
/// `display_name` is only shown to humans.
#[derive(Clone)]
pub struct TaskDefinition {
    /// Unique task name (e.g., "validate")
    pub name: String,
    /// Human-readable name, defaults to `name`
    pub display_name: String,
    /// Free-form description
    pub description: String,
    /// Retry behaviour when the body fails
    pub retry: RetryPolicy,
    /// The callable body
    pub body: TaskBody,
}

impl TaskDefinition {
    /// Build a definition from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            retry: RetryPolicy::default(),
            body: Arc::new(move |input| Box::pin(body(input))),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// A registered flow: a body composing task calls with ordinary control flow
#[derive(Clone)]
pub struct FlowDefinition {
    /// Globally unique flow id (e.g., "data_processing_flow")
    pub flow_id: String,
    /// Human-readable name, defaults to the flow id
    pub name: String,
    /// Free-form description
    pub description: String,
    /// The callable body
    pub body: FlowBody,
}

impl FlowDefinition {
    pub fn new<F, Fut>(flow_id: impl Into<String>, body: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let flow_id = flow_id.into();
        Self {
            name: flow_id.clone(),
            flow_id,
            description: String::new(),
            body: Arc::new(move |params| Box::pin(body(params))),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Serializable summary used by listings and the HTTP layer
    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            flow_id: self.flow_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("flow_id", &self.flow_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Flow metadata without the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub name: String,
    pub description: String,
}

/// Task metadata without the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub max_retries: u32,
}

/// How often and how patiently a failing task is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one fails (0 = no retry)
    pub max_retries: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Retry up to `max_retries` times with exponential backoff from `base`
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base },
        }
    }

    /// Retry up to `max_retries` times with a constant delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Total attempts allowed, always at least one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Delay schedule between task attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// `base * 2^retry`, where retry counts from 0
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay to wait before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base } => {
                let factor = 1u32 << retry.min(20);
                base.saturating_mul(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exponential_backoff_doubles_per_retry() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn default_policy_allows_a_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.backoff.delay(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn task_body_is_callable_through_definition() {
        let task = TaskDefinition::new("double", |input: Value| async move {
            let n = input.as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        })
        .with_display_name("Double it");

        assert_eq!(task.display_name, "Double it");
        let out = (task.body)(json!(21)).await.unwrap();
        assert_eq!(out, json!(42));
    }
}
