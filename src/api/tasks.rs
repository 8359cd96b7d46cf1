//! Task and review endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::service::{CreateGovernedTask, GovernedTask, TaskReviewStatus};
use crate::task::{Task, TaskId};

use super::routes::AppState;
use super::types::*;

/// Create task routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_task))
        .route("/:id", get(get_task))
        .route("/:id/blockers", post(add_blocker))
        .route("/:id/review-status", get(review_status))
        .route("/:id/start", post(start_task))
        .route("/:id/complete", post(complete_task))
}

/// POST /api/tasks - Create a governed task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGovernedTask>,
) -> Result<Json<GovernedTask>, (StatusCode, String)> {
    state
        .service
        .create_governed_task(req)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let id: TaskId = parse_id(&id, "task")?;
    state
        .service
        .get_task(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/tasks/:id/blockers - Re-review after fixing a blocked task.
async fn add_blocker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddBlockerRequest>,
) -> Result<Json<AddBlockerResponse>, (StatusCode, String)> {
    let id: TaskId = parse_id(&id, "task")?;
    let review_task_id = state
        .service
        .add_review_blocker(id, req.review_type, req.context.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(AddBlockerResponse { review_task_id }))
}

async fn review_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskReviewStatus>, (StatusCode, String)> {
    let id: TaskId = parse_id(&id, "task")?;
    state
        .service
        .get_task_review_status(id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let id: TaskId = parse_id(&id, "task")?;
    state
        .service
        .start_task(id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let id: TaskId = parse_id(&id, "task")?;
    state
        .service
        .complete_task(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/reviews/:review_task_id/complete - Record a verdict.
pub(super) async fn complete_review(
    State(state): State<Arc<AppState>>,
    Path(review_task_id): Path<String>,
    Json(req): Json<CompleteReviewRequest>,
) -> Result<Json<CompleteReviewResponse>, (StatusCode, String)> {
    let review_task_id: TaskId = parse_id(&review_task_id, "review task")?;
    let recorded = state
        .service
        .complete_task_review(review_task_id, req.into())
        .await
        .map_err(error_response)?;
    Ok(Json(CompleteReviewResponse { recorded }))
}
