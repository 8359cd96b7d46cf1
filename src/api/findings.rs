//! Findings audit log endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use std::sync::Arc;

use crate::task::{FindingId, TrackedFinding};

use super::routes::AppState;
use super::types::*;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(record_finding))
        .route("/:id/dismiss", post(dismiss_finding))
}

async fn record_finding(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordFindingRequest>,
) -> Result<Json<TrackedFinding>, (StatusCode, String)> {
    state
        .service
        .record_finding(&req.session_id, req.finding)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/findings/:id/dismiss - Requires a non-blank justification.
async fn dismiss_finding(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DismissFindingRequest>,
) -> Result<Json<TrackedFinding>, (StatusCode, String)> {
    let id: FindingId = parse_id(&id, "finding")?;
    state
        .service
        .dismiss_finding(id, &req.justification)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/sessions/:session_id/findings
pub(super) async fn list_findings(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<TrackedFinding>>, (StatusCode, String)> {
    state
        .service
        .list_findings(&session_id)
        .await
        .map(Json)
        .map_err(error_response)
}
