//! Batch job state and snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::batch::query::Query;
use crate::resolver::QueryError;

/// Batch lifecycle.
///
/// `Partial` is the mid-run state visible to polling clients once at least
/// one result is in while others remain pending. `Failed` is reserved for a
/// batch the orchestrator could not dispatch at all; individual query errors
/// never fail a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Running,
    Partial,
    Complete,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::Failed)
    }
}

/// Terminal outcome of one query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Success { result: Value },
    Error { error: QueryError },
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success { .. })
    }
}

/// Per-query entry in a batch snapshot, keyed by `query_id`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub query_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub priority: i32,
    /// `None` while the query is still pending or in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<QueryOutcome>,
}

impl QueryResult {
    pub fn pending(query: &Query) -> Self {
        Self {
            query_id: query.query_id,
            query_type: query.spec.query_type(),
            domain: query.spec.domain().map(|d| d.to_string()),
            priority: query.priority,
            outcome: None,
        }
    }
}

/// Point-in-time view of a batch job, safe to hand to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub max_parallel: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub total_queries: usize,
    pub completed_queries: usize,
    pub succeeded_queries: usize,
    pub results: Vec<QueryResult>,
}

impl BatchSnapshot {
    pub fn result_for(&self, query_id: Uuid) -> Option<&QueryResult> {
        self.results.iter().find(|r| r.query_id == query_id)
    }
}
