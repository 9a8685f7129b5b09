//! HTTP error mapping for the distribution core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use distributor::{DistributionError, QueryError};

/// Error shape returned by every handler: a status code plus a JSON body
/// `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DistributionError> for ApiError {
    fn from(err: DistributionError) -> Self {
        let status = match &err {
            DistributionError::InvalidWebhookUrl(_)
            | DistributionError::InvalidBatch(_)
            | DistributionError::UnsupportedExportFormat(_) => StatusCode::BAD_REQUEST,
            DistributionError::SubscriptionNotFound(_)
            | DistributionError::BatchNotFound(_)
            | DistributionError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            DistributionError::ConnectionNotOpen { .. } => StatusCode::CONFLICT,
            DistributionError::BatchBacklogFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            DistributionError::ExportFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            QueryError::UnknownDomain { .. } => StatusCode::NOT_FOUND,
            QueryError::Unsupported { .. } | QueryError::InvalidParameters { .. } => {
                StatusCode::BAD_REQUEST
            }
            QueryError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}
