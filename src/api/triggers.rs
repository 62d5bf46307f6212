/// Trigger management REST API endpoints
///
/// Create/enable/disable/reschedule/delete go through the scheduler, so
/// changes apply from the next tick boundary.

use super::{api_error, ApiError, AppState};
use crate::{trigger::Trigger, workflow::Params};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for trigger creation
#[derive(Debug, Deserialize)]
pub struct CreateTriggerRequest {
    pub flow_id: String,
    pub cron_expression: String,
    #[serde(default)]
    pub params: Params,
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Request body for a schedule change
#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub cron_expression: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerFilter {
    pub flow_id: Option<String>,
}

/// Create trigger routes
pub fn create_trigger_routes() -> Router<AppState> {
    Router::new()
        .route("/api/triggers", get(list_triggers).post(create_trigger))
        .route("/api/triggers/{id}", get(get_trigger).delete(delete_trigger))
        .route("/api/triggers/{id}/enable", post(enable_trigger))
        .route("/api/triggers/{id}/disable", post(disable_trigger))
        .route("/api/triggers/{id}/schedule", put(reschedule_trigger))
        .route("/api/triggers/{id}/misfires", get(list_misfires))
}

/// GET /api/triggers[?flow_id=..]
async fn list_triggers(
    State(state): State<AppState>,
    Query(filter): Query<TriggerFilter>,
) -> Result<Json<Value>, ApiError> {
    let triggers = match filter.flow_id {
        Some(flow_id) => state.engine.scheduler().list_for_flow(&flow_id).await,
        None => state.engine.list_triggers().await,
    }
    .map_err(api_error)?;
    Ok(Json(json!({ "triggers": triggers })))
}

/// Create a trigger
///
/// POST /api/triggers
/// Body: { "flow_id": "...", "cron_expression": "0 2 * * *", "params": { ... } }
async fn create_trigger(
    State(state): State<AppState>,
    Json(payload): Json<CreateTriggerRequest>,
) -> Result<Json<Trigger>, ApiError> {
    let mut trigger = Trigger::new(&payload.flow_id, &payload.cron_expression, payload.params)
        .with_description(payload.description);
    if let Some(name) = payload.name.filter(|n| !n.trim().is_empty()) {
        trigger = trigger.with_name(name);
    }

    state
        .engine
        .create_named_trigger(trigger)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/triggers/:id
async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trigger>, ApiError> {
    state.engine.get_trigger(&id).await.map(Json).map_err(api_error)
}

/// DELETE /api/triggers/:id
async fn delete_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine.delete_trigger(&id).await.map_err(api_error)?;
    Ok(Json(json!({ "message": format!("Trigger '{}' deleted", id) })))
}

/// POST /api/triggers/:id/enable
async fn enable_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trigger>, ApiError> {
    state.engine.enable_trigger(&id).await.map(Json).map_err(api_error)
}

/// POST /api/triggers/:id/disable
async fn disable_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Trigger>, ApiError> {
    state.engine.disable_trigger(&id).await.map(Json).map_err(api_error)
}

/// PUT /api/triggers/:id/schedule
/// Body: { "cron_expression": "*/5 * * * *" }
async fn reschedule_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RescheduleRequest>,
) -> Result<Json<Trigger>, ApiError> {
    state
        .engine
        .reschedule_trigger(&id, &payload.cron_expression)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/triggers/:id/misfires
async fn list_misfires(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let misfires = state.engine.trigger_misfires(&id).await.map_err(api_error)?;
    Ok(Json(json!({ "misfires": misfires })))
}
