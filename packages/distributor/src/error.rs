//! Error types for the distribution core.
//!
//! The taxonomy follows the failure classes the core distinguishes:
//! malformed input is rejected synchronously at the boundary, capacity
//! exhaustion fails fast with a retryable error, and lookups of unknown
//! resources are their own variants so the HTTP layer can map them to 404s.
//! Transient delivery failures never appear here; they live in delivery
//! history only.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("batch {0} not found")]
    BatchNotFound(Uuid),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("batch backlog full: {in_flight} jobs in flight, ceiling is {ceiling}")]
    BatchBacklogFull { in_flight: usize, ceiling: usize },

    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error("connection {id} is {state}, expected open")]
    ConnectionNotOpen { id: Uuid, state: &'static str },

    #[error("unsupported export format: {0}")]
    UnsupportedExportFormat(String),

    #[error("export failed: {0}")]
    ExportFailed(String),
}

impl DistributionError {
    /// Whether the caller may retry the same request later and expect it
    /// to succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DistributionError::BatchBacklogFull { .. })
    }
}
