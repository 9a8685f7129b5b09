//! One-off query execution outside a batch.

use axum::extract::Extension;
use axum::Json;
use serde_json::Value;

use distributor::batch::Query;
use distributor::{QueryError, QueryResolver};

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// Resolve a single query synchronously, bounded by the per-query timeout.
pub async fn query_handler(
    Extension(state): Extension<AppState>,
    Json(query): Json<Query>,
) -> Result<Json<Value>, ApiError> {
    query.validate().map_err(ApiError::bad_request)?;

    let result = tokio::time::timeout(state.query_timeout, state.resolver.resolve(&query))
        .await
        .map_err(|_| {
            ApiError::from(QueryError::Timeout {
                timeout_ms: state.query_timeout.as_millis() as u64,
            })
        })??;

    Ok(Json(result))
}
