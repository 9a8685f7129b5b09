// HTTP routes
pub mod batch;
pub mod events;
pub mod health;
pub mod query;
pub mod stream;
pub mod webhooks;

pub use batch::{batch_status_handler, export_handler, submit_batch_handler};
pub use events::{publish_event_handler, update_domain_handler};
pub use health::health_handler;
pub use query::query_handler;
pub use stream::stream_handler;
pub use webhooks::{
    deliveries_handler, list_webhooks_handler, register_webhook_handler, remove_webhook_handler,
    test_webhook_handler,
};
