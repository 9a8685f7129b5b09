//! Batch submission, status polling, and export.

use std::time::Duration;

use axum::extract::{Extension, Path, Query as QueryParams};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use distributor::batch::{BatchOptions, BatchSnapshot, ExportFormat, Query};

use crate::server::app::AppState;
use crate::server::error::ApiError;

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct SubmitBatchRequest {
    pub queries: Vec<Query>,
    /// `false` forces sequential execution regardless of `max_parallel`.
    #[serde(default = "default_true")]
    pub parallel_execution: bool,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub overall_timeout_ms: Option<u64>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Submit a batch of queries for parallel execution.
///
/// 202 with the batch id; progress is polled via the status endpoint or
/// announced by the `batch_complete` event / callback.
pub async fn submit_batch_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let mut options = BatchOptions::default();
    if let Some(max_parallel) = request.max_parallel {
        options.max_parallel = max_parallel;
    }
    if !request.parallel_execution {
        options.max_parallel = 1;
    }
    options.overall_timeout = request.overall_timeout_ms.map(Duration::from_millis);
    options.callback_url = request.callback_url;

    let batch_id = state.orchestrator.submit(request.queries, options)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "batch_id": batch_id }))))
}

pub async fn batch_status_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    let snapshot = state.orchestrator.status(id).await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub format: Option<String>,
}

/// Export batch results as JSON, CSV, or XLSX (`?format=`).
pub async fn export_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    QueryParams(params): QueryParams<ExportParams>,
) -> Result<Response, ApiError> {
    let format: ExportFormat = params.format.as_deref().unwrap_or("json").parse()?;
    let bytes = state.orchestrator.export(id, format).await?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], bytes).into_response())
}
