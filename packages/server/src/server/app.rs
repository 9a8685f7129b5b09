//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use distributor::bus::DEFAULT_CONSUMER_CAPACITY;
use distributor::{
    BatchOrchestrator, ConnectionRegistry, EventBus, SnapshotResolver, WebhookDispatcher,
};

use crate::config::Config;
use crate::server::middleware::{bearer_auth_middleware, Authorizer, StaticTokenAuthorizer};
use crate::server::routes::{
    batch_status_handler, deliveries_handler, export_handler, health_handler,
    list_webhooks_handler, publish_event_handler, query_handler, register_webhook_handler,
    remove_webhook_handler, stream_handler, submit_batch_handler, test_webhook_handler,
    update_domain_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub connections: ConnectionRegistry,
    pub webhooks: WebhookDispatcher,
    pub orchestrator: BatchOrchestrator,
    pub resolver: Arc<SnapshotResolver>,
    pub auth: Arc<dyn Authorizer>,
    pub query_timeout: Duration,
}

impl AppState {
    /// Wire the distribution core together and spawn the bus consumers.
    ///
    /// Must run inside a tokio runtime: the connection fan-out loop, the
    /// webhook intake loop, and the delivery workers are all spawned here.
    pub fn new(config: &Config) -> Self {
        let bus = EventBus::new();

        let connections = ConnectionRegistry::with_queue_capacity(config.connection_queue_capacity);
        let (_fanout, fanout_rx) = bus.subscribe("connection-fanout", DEFAULT_CONSUMER_CAPACITY);
        tokio::spawn(connections.clone().run(fanout_rx));

        let webhooks = WebhookDispatcher::start(config.webhook_config());
        let (_intake, intake_rx) = bus.subscribe("webhook-intake", DEFAULT_CONSUMER_CAPACITY);
        webhooks.spawn_intake(intake_rx);

        let resolver = Arc::new(SnapshotResolver::new());
        let orchestrator =
            BatchOrchestrator::new(bus.clone(), resolver.clone(), config.batch_config());

        Self {
            bus,
            connections,
            webhooks,
            orchestrator,
            resolver,
            auth: Arc::new(StaticTokenAuthorizer::new(config.api_tokens.clone())),
            query_timeout: config.query_timeout,
        }
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState) -> Router {
    // CORS: dashboards and browser clients connect cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let auth = state.auth.clone();
    let protected = Router::new()
        // Producer ingress
        .route("/events", post(publish_event_handler))
        .route("/domains", post(update_domain_handler))
        // One-off queries
        .route("/query", post(query_handler))
        // Batch orchestration
        .route("/batch", post(submit_batch_handler))
        .route("/batch/:id/status", get(batch_status_handler))
        .route("/batch/:id/export", get(export_handler))
        // Webhook subscriptions
        .route(
            "/webhooks",
            post(register_webhook_handler).get(list_webhooks_handler),
        )
        .route("/webhooks/:id", axum::routing::delete(remove_webhook_handler))
        .route("/webhooks/:id/test", post(test_webhook_handler))
        .route("/webhooks/:id/deliveries", get(deliveries_handler))
        // Live streaming
        .route("/stream", get(stream_handler))
        .layer(middleware::from_fn(move |req, next| {
            bearer_auth_middleware(auth.clone(), req, next)
        }));

    Router::new()
        // Health check (no auth)
        .route("/health", get(health_handler))
        .merge(protected)
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
