/// HTTP API Layer
///
/// Thin REST adapter over the engine facade. It handles:
/// - Flow listing, detail and manual runs
/// - Execution history queries, logs and cancellation
/// - Trigger management

// Flow endpoints
pub mod flows;

// Execution history endpoints
pub mod executions;

// Trigger management endpoints
pub mod triggers;

use crate::{error::EngineError, runtime::Engine};
use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Engine facade (registry, executor, history, scheduler)
    pub engine: Engine,
}

/// Error response: status code plus `{ "error": kind, "message": ... }`
pub type ApiError = (StatusCode, Json<Value>);

/// Map an engine error onto an HTTP response
pub fn api_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::DuplicateDefinition { .. } => StatusCode::CONFLICT,
        EngineError::InvalidCron { .. } => StatusCode::BAD_REQUEST,
        EngineError::TaskFailure { .. }
        | EngineError::FlowFailure { .. }
        | EngineError::SchedulerMisfire { .. }
        | EngineError::Cancelled => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::NoActiveExecution | EngineError::Storage(_) => {
            tracing::error!("❌ Internal error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "error": err.kind_name(), "message": err.to_string() })),
    )
}

/// All API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(flows::create_flow_routes())
        .merge(executions::create_execution_routes())
        .merge(triggers::create_trigger_routes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let (status, body) = api_error(EngineError::flow_not_found("f1"));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0["error"], "NotFound");

        let (status, _) = api_error(EngineError::InvalidCron {
            expression: "x".into(),
            reason: "bad".into(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
