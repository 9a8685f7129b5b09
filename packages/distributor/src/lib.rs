//! Intelligence distribution core.
//!
//! Fans analysis results out from producers to three kinds of consumers:
//! live streaming connections, registered webhook endpoints, and on-demand
//! batch queries.
//!
//! # Architecture
//!
//! ```text
//!  producers ──► EventBus ──┬──► ConnectionRegistry ──► streaming clients
//!                           │       (bounded per-connection queues,
//!                           │        drop-oldest + overflow marker)
//!                           │
//!                           └──► WebhookDispatcher ──► HTTP endpoints
//!                                   (filter match, HMAC signing,
//!                                    bounded retries with backoff)
//!
//!  clients ──► BatchOrchestrator ──► QueryResolver
//!                (priority dispatch, bounded parallelism,
//!                 per-query + overall timeouts, export)
//! ```
//!
//! The bus is the only coupling between producers and consumers: a slow
//! webhook endpoint or streaming client can lose its own events but never
//! stalls a producer or another consumer.

pub mod batch;
pub mod bus;
pub mod connection;
pub mod error;
pub mod event;
pub mod resolver;
pub mod webhook;

pub use batch::{BatchConfig, BatchOptions, BatchOrchestrator, BatchSnapshot, ExportFormat};
pub use bus::{BusConsumerStats, ConsumerHandle, EventBus};
pub use connection::{ConnectionRegistry, ConnectionState, PushMessage};
pub use error::DistributionError;
pub use event::{AnalysisEvent, EventType};
pub use resolver::{DomainSnapshot, QueryError, QueryResolver, SnapshotResolver};
pub use webhook::{Subscription, SubscriptionRegistry, WebhookConfig, WebhookDispatcher};
