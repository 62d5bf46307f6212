/// Flow REST API endpoints
///
/// Flows are registered in code, so the API only lists, inspects and runs them.

use super::{api_error, ApiError, AppState};
use crate::{runtime::FlowDetail, workflow::Params};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for a manual run
#[derive(Debug, Deserialize)]
pub struct RunFlowRequest {
    #[serde(default)]
    pub params: Params,
    /// Wait for the terminal state (default) or return right after queueing
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

/// Create flow routes
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{id}", get(get_flow))
        .route("/api/flows/{id}/run", post(run_flow))
}

/// List registered flows
///
/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "flows": state.engine.list_flows() }))
}

/// Flow definition, its triggers and execution counts
///
/// GET /api/flows/:id
async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowDetail>, ApiError> {
    state.engine.get_flow_detail(&id).await.map(Json).map_err(api_error)
}

/// Run a flow manually
///
/// POST /api/flows/:id/run
/// Body: { "params": { ... }, "wait": true }
async fn run_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    // An empty body runs with no parameters
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunFlowRequest {
            params: Params::new(),
            wait: true,
        }
    } else {
        serde_json::from_slice::<RunFlowRequest>(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "InvalidRequest", "message": e.to_string() })),
            )
        })?
    };

    let handle = state.engine.submit(&id, request.params).await.map_err(api_error)?;
    tracing::info!("▶️ Manual run of flow '{}' queued as {}", id, handle.execution_id());

    if !request.wait {
        return Ok(Json(json!({
            "execution_id": handle.execution_id(),
            "status": handle.status(),
        })));
    }

    let execution = handle.wait().await.map_err(api_error)?;
    Ok(Json(json!({ "execution": execution })))
}
