/// Execution history REST API endpoints

use super::{api_error, ApiError, AppState};
use crate::history::{Execution, ExecutionQuery, ExecutionStatus, DEFAULT_PAGE_SIZE};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

/// Largest page a client may request
const MAX_PAGE_SIZE: u32 = 500;

/// Query-string filters for execution listings
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl From<ExecutionFilter> for ExecutionQuery {
    fn from(filter: ExecutionFilter) -> Self {
        ExecutionQuery {
            flow_id: filter.flow_id,
            status: filter.status,
            since: filter.since,
            until: filter.until,
            limit: filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: filter.offset.unwrap_or(0),
        }
    }
}

/// Create execution routes
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/logs", get(get_execution_logs))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
}

/// Query executions, most recent first
///
/// GET /api/executions?flow_id=..&status=failed&since=..&until=..&limit=50&offset=0
async fn list_executions(
    State(state): State<AppState>,
    Query(filter): Query<ExecutionFilter>,
) -> Result<Json<Value>, ApiError> {
    let query = ExecutionQuery::from(filter);
    let executions = state.engine.query_executions(&query).await.map_err(api_error)?;
    Ok(Json(json!({
        "executions": executions,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

/// GET /api/executions/:id
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    state.engine.get_execution(&id).await.map(Json).map_err(api_error)
}

/// Log lines of one execution, formatted and structured
///
/// GET /api/executions/:id/logs
async fn get_execution_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lines = state.engine.execution_logs(&id).await.map_err(api_error)?;
    let text: Vec<String> = lines.iter().map(|line| line.format()).collect();
    Ok(Json(json!({ "lines": lines, "text": text })))
}

/// Request cancellation of a queued or running execution
///
/// POST /api/executions/:id/cancel
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.engine.cancel(&id).await.map_err(api_error)?;
    Ok(Json(json!({ "execution_id": id, "cancelled": cancelled })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_and_clamps_paging() {
        let query = ExecutionQuery::from(ExecutionFilter {
            limit: Some(10_000),
            ..ExecutionFilter::default()
        });
        assert_eq!(query.limit, MAX_PAGE_SIZE);
        assert_eq!(query.offset, 0);

        let query = ExecutionQuery::from(ExecutionFilter::default());
        assert_eq!(query.limit, DEFAULT_PAGE_SIZE);
    }
}
