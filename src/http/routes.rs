use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::{Goal, GoalKind, GoalStatus};
use crate::domain::ports::GoalFilter;
use crate::domain::OpsError;

use super::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/goals", get(list_goals))
        .route("/goals/{id}", get(get_goal))
        .route("/goals/{id}/approve", post(approve_goal))
        .route("/goals/{id}/reject", post(reject_goal))
        .route("/scheduler/jobs", get(list_jobs))
        .route("/health", get(health))
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiErrorWrapper {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiError { error: ApiErrorBody { kind: self.0.kind(), message: self.0.to_string() } };
        (status, Json(body)).into_response()
    }
}

/// Wraps `OpsError` so it can implement a foreign trait (`IntoResponse`)
/// for a foreign type.
struct ApiErrorWrapper(OpsError);

impl From<OpsError> for ApiErrorWrapper {
    fn from(err: OpsError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
struct ListGoalsQuery {
    status: Option<String>,
    kind: Option<String>,
    limit: Option<i64>,
}

async fn list_goals(State(state): State<Arc<AppState>>, Query(query): Query<ListGoalsQuery>) -> Result<Json<Vec<Goal>>, ApiErrorWrapper> {
    let status = query.status.as_deref().and_then(parse_status);
    let kind = query.kind.as_deref().and_then(GoalKind::from_str);
    let limit = query.limit.unwrap_or(100);
    let goals = state.store.list_goals(GoalFilter { status, kind }, limit).await.map_err(OpsError::from)?;
    Ok(Json(goals))
}

fn parse_status(s: &str) -> Option<GoalStatus> {
    match s {
        "identified" => Some(GoalStatus::Identified),
        "approved" => Some(GoalStatus::Approved),
        "rejected" => Some(GoalStatus::Rejected),
        "completed" => Some(GoalStatus::Completed),
        _ => None,
    }
}

async fn get_goal(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<Goal>, ApiErrorWrapper> {
    let goal = state.store.get_goal(id).await.map_err(OpsError::from)?.ok_or(OpsError::NotFound { entity: "goal", id })?;
    Ok(Json(goal))
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    actor: String,
    notes: Option<String>,
}

async fn approve_goal(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>, Json(body): Json<ActionBody>) -> Result<Json<Goal>, ApiErrorWrapper> {
    let goal = state.approval_gate.approve(id, &body.actor, body.notes.as_deref()).await?;
    Ok(Json(goal))
}

async fn reject_goal(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>, Json(body): Json<ActionBody>) -> Result<Json<Goal>, ApiErrorWrapper> {
    let goal = state.approval_gate.reject(id, &body.actor, body.notes.as_deref()).await?;
    Ok(Json(goal))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<crate::scheduler::JobStatus>> {
    Json(state.scheduler.job_statuses().await)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pools: Vec<crate::connection_pool::PoolHealth>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", pools: state.connection_pool.health().await })
}
