//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::gate::{GateDecision, GateRequest};
use crate::service::{GovernanceService, SpawnMode};
use crate::task::ReviewRecord;

use super::findings;
use super::tasks;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub service: GovernanceService,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/tasks", tasks::routes())
        .route(
            "/api/reviews/:review_task_id/complete",
            post(tasks::complete_review),
        )
        .route("/api/gate/check", post(check_gate))
        .route("/api/sessions/:session_id/reviews", get(session_reviews))
        .route("/api/sessions/:session_id/flag", delete(clear_flag))
        .route(
            "/api/sessions/:session_id/findings",
            get(findings::list_findings),
        )
        .nest("/api/findings", findings::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let service = GovernanceService::from_config(&config, SpawnMode::InProcess).await?;
    if service.store().is_persistent() {
        tracing::info!(
            "Governance store at {}",
            config.db_path().display()
        );
    } else {
        tracing::warn!("Using in-memory governance store, reviews are lost on restart");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState { config, service });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT.
///
/// In-flight settle coordinators are dropped; their flags go stale and stop
/// blocking after `stale_after`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent: state.service.store().is_persistent(),
    })
}

/// POST /api/gate/check - 200 when allowed, 403 when denied. The body is
/// the decision either way.
async fn check_gate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GateRequest>,
) -> (StatusCode, Json<GateDecision>) {
    let decision = state.service.check_gate(&req).await;
    let status = if decision.allow {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(decision))
}

async fn session_reviews(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ReviewRecord>>, (StatusCode, String)> {
    state
        .service
        .list_session_reviews(&session_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// DELETE /api/sessions/:session_id/flag - human override of the session flag.
async fn clear_flag(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ClearFlagResponse>, (StatusCode, String)> {
    let cleared = state
        .service
        .clear_flag(&session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(ClearFlagResponse { cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::CreateGovernedTask;
    use crate::store::StoreType;
    use crate::task::ReviewType;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(dir: &TempDir) -> (Router, Arc<AppState>) {
        let mut config = Config::for_data_dir(dir.path());
        config.store_type = StoreType::Memory;
        let service = GovernanceService::from_config(&config, SpawnMode::Disabled)
            .await
            .unwrap();
        let state = Arc::new(AppState { config, service });
        (router(state.clone()), state)
    }

    async fn check(router: Router, body: serde_json::Value) -> (StatusCode, GateDecision) {
        let req = Request::builder()
            .method("POST")
            .uri("/api/gate/check")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// The gate answers 200 with no review in flight and 403 with the reason
    /// once a governed task raised the session flag.
    #[tokio::test]
    async fn test_gate_check_status_codes() {
        let dir = TempDir::new().unwrap();
        let (router, state) = app(&dir).await;

        let (status, decision) =
            check(router.clone(), serde_json::json!({ "session_id": "s1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert!(decision.allow);

        let created = state
            .service
            .create_governed_task(CreateGovernedTask {
                session_id: "s1".to_string(),
                subject: "T1".to_string(),
                description: None,
                context: None,
                review_type: ReviewType::General,
            })
            .await
            .unwrap();

        let (status, decision) = check(
            router.clone(),
            serde_json::json!({
                "session_id": "s1",
                "task_id": created.task_id,
                "action": "complete",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!decision.allow);
        assert!(decision.reason.starts_with("Review pending"));

        let (status, _) = check(router, serde_json::json!({ "session_id": "s2" })).await;
        assert_eq!(status, StatusCode::OK);
    }
}
