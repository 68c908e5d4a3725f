//! Router, shared state and handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::runs::{RunEntry, RunRegistry};
use crate::budget::{ModelCost, UsageRecord};
use crate::pipeline::{validate_niche, AnalysisPipeline};

const USAGE_PAGE: usize = 50;

/// State shared by every handler.
pub struct AppState {
    pub pipeline: Arc<AnalysisPipeline>,
    pub runs: RunRegistry,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<AnalysisPipeline>) -> Self {
        Self {
            pipeline,
            runs: RunRegistry::new(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub niche: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/budget", get(budget_status))
        .route("/api/budget/usage", get(budget_usage))
        .route("/api/budget/emergency-stop", post(emergency_stop))
        .route("/api/models", get(list_models))
        .route("/api/pipeline/run", post(start_run))
        .route("/api/pipeline/runs/:id", get(get_run))
        .route("/api/pipeline/status", get(latest_run))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn budget_status(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let status = state
        .pipeline
        .ledger()
        .get_status()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(status.to_record()))
}

async fn budget_usage(State(state): State<Arc<AppState>>) -> ApiResult<Vec<UsageRecord>> {
    let usage = state
        .pipeline
        .ledger()
        .recent_usage(USAGE_PAGE)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(usage))
}

/// Cancel every run still in flight. Each one finishes as FAILED with a
/// local backup.
async fn emergency_stop(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stopped = state.runs.cancel_all().await;
    tracing::warn!(runs = stopped.len(), "Emergency stop requested");
    Json(json!({
        "success": true,
        "message": format!("Emergency stop issued to {} running pipeline(s)", stopped.len()),
        "stopped": stopped,
    }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelCost>> {
    Json(state.pipeline.ledger().registry().iter().cloned().collect())
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    validate_niche(&req.niche).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let (entry, cancel) = state.runs.start(&req.niche).await;
    let task_id = entry.task_id;
    tracing::info!(task_id = %task_id, niche = %req.niche, "Pipeline run accepted");

    let bg = Arc::clone(&state);
    tokio::spawn(async move {
        let result = bg.pipeline.run_with_cancel(&req.niche, cancel).await;
        tracing::info!(
            task_id = %task_id,
            status = %result.status,
            credits = result.total_credits_used,
            "Pipeline run finished"
        );
        bg.runs.finish(task_id, &result).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": entry.status })),
    ))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RunEntry> {
    state
        .runs
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Run {} not found", id)))
}

async fn latest_run(State(state): State<Arc<AppState>>) -> ApiResult<RunEntry> {
    state
        .runs
        .latest()
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No pipeline run yet".to_string()))
}
