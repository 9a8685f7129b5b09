//! Webhook subscription management.

use std::collections::HashSet;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use distributor::webhook::{DeliveryAttempt, Subscription};
use distributor::EventType;

use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Deserialize)]
pub struct RegisterWebhookRequest {
    pub url: String,
    /// Empty means every event type.
    #[serde(default)]
    pub events: HashSet<EventType>,
    /// Empty means every domain.
    #[serde(default)]
    pub domains: HashSet<String>,
    pub secret: String,
}

/// Register a webhook subscription. The secret is write-only: it signs
/// payloads but never appears in any response.
pub async fn register_webhook_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RegisterWebhookRequest>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    if request.secret.is_empty() {
        return Err(ApiError::bad_request("secret must not be empty"));
    }
    let subscription = state.webhooks.register_subscription(
        &request.url,
        request.events,
        request.domains,
        request.secret,
    )?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list_webhooks_handler(
    Extension(state): Extension<AppState>,
) -> Json<Vec<Subscription>> {
    Json(state.webhooks.list_subscriptions())
}

/// Deactivate a subscription. Delivery history stays queryable.
pub async fn remove_webhook_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.webhooks.remove_subscription(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fire a synthetic test delivery at one subscription.
pub async fn test_webhook_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryAttempt>, ApiError> {
    let attempt = state.webhooks.test_delivery(id).await?;
    Ok(Json(attempt))
}

/// Delivery history for a subscription, most-recent-first.
pub async fn deliveries_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryAttempt>>, ApiError> {
    let attempts = state.webhooks.list_deliveries(id)?;
    Ok(Json(attempts))
}
