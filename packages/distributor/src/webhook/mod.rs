//! At-least-once webhook delivery with bounded retries.
//!
//! - [`SubscriptionRegistry`] — durable subscription records with filter
//!   matching and soft deletion
//! - [`DeliveryLog`] — per-subscription attempt history; every attempt ends
//!   in a recorded terminal status
//! - [`WebhookDispatcher`] — bus intake, filter evaluation, and the bounded
//!   worker pool that performs signed HTTP deliveries
//! - [`signature`] — HMAC-SHA256 body signing and verification

pub mod delivery;
pub mod dispatcher;
pub mod signature;
pub mod subscription;

pub use delivery::{
    backoff_delay, DeliveryAttempt, DeliveryEnvelope, DeliveryLog, DeliveryStatus,
};
pub use dispatcher::{WebhookConfig, WebhookDispatcher, WebhookStats};
pub use subscription::{Subscription, SubscriptionRegistry};
