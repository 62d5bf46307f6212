/// Trigger record types
///
/// A trigger binds a flow id to a cron expression and a fixed parameter map.
/// The flow id is a weak reference: removing the flow leaves the trigger in
/// place and it fails at fire time instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::Params;

/// Cron-scheduled binding of a flow to static parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Generated identifier (UUID v4)
    pub id: String,
    /// Flow fired by this trigger
    pub flow_id: String,
    /// Human-readable name, defaults to the flow id
    pub name: String,
    pub description: String,
    /// Standard 5-field cron expression
    pub cron_expression: String,
    /// Static parameters passed to every fire
    pub params: Params,
    /// Disabled triggers stay stored but never fire
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Boundary of the most recent fire
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Most recent scheduling error (bad cron, submit failure)
    pub last_error: Option<String>,
}

impl Trigger {
    /// New enabled trigger with a fresh id
    pub fn new(flow_id: &str, cron_expression: &str, params: Params) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            name: flow_id.to_string(),
            description: String::new(),
            cron_expression: cron_expression.trim().to_string(),
            params,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            last_error: None,
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

    /// Mark as modified now
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Why a due fire did not produce an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireReason {
    /// Previous fire of the same trigger had not finished yet
    StillRunning,
    /// Boundary passed beyond the misfire grace window
    Missed,
}

impl MisfireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireReason::StillRunning => "still_running",
            MisfireReason::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "still_running" => Some(MisfireReason::StillRunning),
            "missed" => Some(MisfireReason::Missed),
            _ => None,
        }
    }
}

/// A recorded skip of a due fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisfireEvent {
    pub trigger_id: String,
    /// Cron boundary that was due
    pub scheduled_for: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub reason: MisfireReason,
    /// Execution still holding the trigger, for `StillRunning`
    pub blocking_execution_id: Option<String>,
}

impl MisfireEvent {
    pub fn new(trigger_id: &str, scheduled_for: DateTime<Utc>, reason: MisfireReason) -> Self {
        Self {
            trigger_id: trigger_id.to_string(),
            scheduled_for,
            recorded_at: Utc::now(),
            reason,
            blocking_execution_id: None,
        }
    }
}
