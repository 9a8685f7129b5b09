//! Producer ingress: analysis events and domain snapshot updates.

use std::collections::HashMap;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use distributor::{AnalysisEvent, DomainSnapshot, EventType};

use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Deserialize)]
pub struct PublishEventRequest {
    pub event_type: EventType,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Publish an analysis event onto the bus.
///
/// 202: acceptance means the event reached the bus, not that any consumer
/// has processed it.
pub async fn publish_event_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut event = AnalysisEvent::new(request.event_type, request.domain, request.payload);
    if let Some(confidence) = request.confidence {
        event = event.with_confidence(confidence);
    }
    let event_id = event.event_id;
    let consumers = state.bus.publish(event);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event_id, "consumers": consumers })),
    ))
}

#[derive(Deserialize)]
pub struct UpdateDomainRequest {
    pub domain: String,
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Replace the snapshot for a domain and announce the update on the bus.
pub async fn update_domain_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<UpdateDomainRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.domain.is_empty() {
        return Err(ApiError::bad_request("domain must not be empty"));
    }

    let snapshot = DomainSnapshot {
        domain: request.domain.clone(),
        metrics: request.metrics.clone(),
        summary: request.summary,
        updated_at: Utc::now(),
    };
    state.resolver.update_domain(snapshot);

    state.bus.publish(AnalysisEvent::new(
        EventType::DomainUpdate,
        Some(request.domain.clone()),
        json!({ "metrics": request.metrics }),
    ));

    Ok((
        StatusCode::OK,
        Json(json!({ "domain": request.domain, "tracked_domains": state.resolver.domain_count() })),
    ))
}
