//! JSON trigger surface for pipeline runs and execution history.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prisguide_sync::{Pipeline, PipelineError, RegistryError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "prisguide-web";

const DEFAULT_EXECUTION_LIMIT: usize = 50;
const MAX_EXECUTION_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", post(run_all_handler))
        .route("/runs/{category}", post(run_category_handler))
        .route("/categories/{category}/endpoints", get(endpoints_handler))
        .route("/executions", get(executions_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let (config, pipeline) = prisguide_sync::pipeline_from_env().await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn run_all_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.run_all_categories().await).into_response()
}

async fn run_category_handler(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
) -> Response {
    match state.pipeline.run_category(&category).await {
        Ok(result) => Json(result).into_response(),
        Err(err @ PipelineError::UnknownCategory(_)) => error_response(StatusCode::NOT_FOUND, err),
    }
}

async fn endpoints_handler(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
) -> Response {
    match state.pipeline.registry().list_active_endpoints(&category).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(err @ RegistryError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, err),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    limit: Option<usize>,
}

async fn executions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EXECUTION_LIMIT)
        .clamp(1, MAX_EXECUTION_LIMIT);
    match state.pipeline.logger().recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}
