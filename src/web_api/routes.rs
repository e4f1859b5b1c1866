//! Route table and HTTP handlers

use crate::control_plane::ConfigDelta;
use crate::error::{Error, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/ws/:camera_id", get(super::ws::viewer_ws))
        .route("/api/bridge/stats", get(bridge_stats))
        .route("/api/stats", get(all_stats))
        .route("/api/stats/:camera_id", get(camera_stats))
        .route("/api/workers/status", get(all_worker_status))
        .route("/api/workers/:camera_id/start", post(start_worker))
        .route("/api/workers/:camera_id/stop", post(stop_worker))
        .route("/api/workers/:camera_id/restart", post(restart_worker))
        .route("/api/workers/:camera_id/status", get(worker_status))
        .route("/api/config/changes", post(publish_config_change))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn bridge_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.stats().await)
}

async fn all_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats_cache.all().await)
}

async fn camera_stats(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse> {
    match state.stats_cache.get(&camera_id).await {
        Some(cached) => Ok(Json(cached)),
        None => Err(Error::NotFound(format!(
            "no stats for camera {}",
            camera_id
        ))),
    }
}

async fn start_worker(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    let outcome = state.supervisor.start(&camera_id).await;
    outcome_response(outcome)
}

async fn stop_worker(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    let outcome = state.supervisor.stop(&camera_id).await;
    outcome_response(outcome)
}

async fn restart_worker(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    let outcome = state.supervisor.restart(&camera_id).await;
    outcome_response(outcome)
}

async fn worker_status(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    Json(state.supervisor.status(&camera_id).await)
}

#[derive(Debug, Deserialize)]
struct BatchStatusQuery {
    /// Comma-separated camera ids; all directory entries when omitted
    cameras: Option<String>,
}

async fn all_worker_status(
    State(state): State<AppState>,
    Query(query): Query<BatchStatusQuery>,
) -> impl IntoResponse {
    let ids = query.cameras.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect::<Vec<_>>()
    });
    Json(state.supervisor.batch_status(ids).await)
}

/// Operator-facing refusals are still 200s with `ok:false`; only the body
/// tells the story. Failed operations on a known camera are a conflict.
fn outcome_response(outcome: crate::supervisor::OpOutcome) -> impl IntoResponse {
    let status = if outcome.ok {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(outcome))
}

async fn publish_config_change(
    State(state): State<AppState>,
    Json(delta): Json<ConfigDelta>,
) -> Result<impl IntoResponse> {
    if delta.key.is_empty() {
        return Err(Error::Validation("config delta key must not be empty".to_string()));
    }
    state.notifier.publish(&delta).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "published", "key": delta.key })),
    ))
}
