use axum::{extract::Extension, Json};
use serde::Serialize;

use distributor::webhook::WebhookStats;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    connections: usize,
    bus_consumers: usize,
    webhook_subscriptions: usize,
    batches_in_flight: usize,
    tracked_domains: usize,
    webhook_stats: WebhookStats,
}

/// Health check endpoint
///
/// Reports liveness plus the headline counters of each subsystem. Always
/// 200: the distribution core has no external dependency that can take it
/// unhealthy while the process is up.
pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.len(),
        bus_consumers: state.bus.consumer_count(),
        webhook_subscriptions: state.webhooks.list_subscriptions().len(),
        batches_in_flight: state.orchestrator.in_flight(),
        tracked_domains: state.resolver.domain_count(),
        webhook_stats: state.webhooks.stats(),
    })
}
