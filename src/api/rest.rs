// =============================================================================
// Control surface — Axum 0.7
// =============================================================================
//
// The thin command interface over the core. Authentication, user management,
// and dashboard fan-out live in the façade above this router.
//
//   GET  /api/v1/health                    liveness
//   GET  /api/v1/status                    full subsystem status (always responds)
//   POST /api/v1/control/start             start the orchestrator loop
//   POST /api/v1/control/stop              stop the orchestrator loop
//   POST /api/v1/control/flatten-all       URGENT_CLOSE regardless of time
//   POST /api/v1/control/feed-reconnect    force the feed takeover path
//   POST /api/v1/control/skip-auto-init    toggle the break-glass hold
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;

/// Build the control router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/control/start", post(control_start))
        .route("/api/v1/control/stop", post(control_stop))
        .route("/api/v1/control/flatten-all", post(control_flatten_all))
        .route("/api/v1/control/feed-reconnect", post(control_feed_reconnect))
        .route("/api/v1/control/skip-auto-init", post(control_skip_auto_init))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status())
}

#[derive(Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn control_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.start() {
        Ok(()) => (
            StatusCode::OK,
            Json(ControlResponse {
                ok: true,
                message: None,
            }),
        ),
        Err(reason) => (
            StatusCode::CONFLICT,
            Json(ControlResponse {
                ok: false,
                message: Some(format!("NOT_READY: {reason}")),
            }),
        ),
    }
}

async fn control_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.orchestrator.stop();
    Json(ControlResponse {
        ok: true,
        message: None,
    })
}

async fn control_flatten_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("flatten-all requested via control surface");
    state.monitor.flatten_all();
    Json(ControlResponse {
        ok: true,
        message: Some("urgent close engaged".to_string()),
    })
}

async fn control_feed_reconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.ingestor.force_reconnect();
    Json(ControlResponse {
        ok: true,
        message: Some("reconnect requested".to_string()),
    })
}

#[derive(Deserialize)]
struct SkipAutoInitRequest {
    enabled: bool,
}

async fn control_skip_auto_init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SkipAutoInitRequest>,
) -> impl IntoResponse {
    info!(enabled = body.enabled, "skip-auto-init toggled");
    state.ingestor.set_skip_auto_init(body.enabled);
    Json(ControlResponse {
        ok: true,
        message: None,
    })
}
