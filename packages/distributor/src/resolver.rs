//! Stateless read layer over current analysis state.
//!
//! [`QueryResolver`] is the seam between the distribution core and whatever
//! analysis store exists outside it. A resolve call must be idempotent,
//! side-effect-free, and bounded in time (the orchestrator enforces a
//! per-query timeout on top). Errors are returned, never panicked, so the
//! batch orchestrator can always attribute a failure to a `query_id`.
//!
//! [`SnapshotResolver`] is the in-memory implementation: analyzers push
//! domain snapshots in, queries read the current state back out. It keeps
//! no history, so historical and predictive queries report unsupported;
//! those capabilities belong to external analyzer collaborators.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::batch::query::{Query, QuerySpec};

/// Why a query could not be resolved.
///
/// Serializable so it can be recorded as a batch result and exported.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryError {
    #[error("query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("unknown domain: {domain}")]
    UnknownDomain { domain: String },

    #[error("unsupported query: {reason}")]
    Unsupported { reason: String },

    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("upstream failure: {message}")]
    Upstream { message: String },
}

/// Resolves one structured query against current analysis state.
#[async_trait]
pub trait QueryResolver: Send + Sync {
    async fn resolve(&self, query: &Query) -> Result<Value, QueryError>;
}

/// Current analysis state for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain: String,
    pub metrics: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory resolver over the latest domain snapshots.
#[derive(Clone, Default)]
pub struct SnapshotResolver {
    domains: std::sync::Arc<DashMap<String, DomainSnapshot>>,
}

impl SnapshotResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer-side write path: replace the snapshot for a domain.
    pub fn update_domain(&self, snapshot: DomainSnapshot) {
        self.domains.insert(snapshot.domain.clone(), snapshot);
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    fn snapshot(&self, domain: &str) -> Result<DomainSnapshot, QueryError> {
        self.domains
            .get(domain)
            .map(|entry| entry.clone())
            .ok_or_else(|| QueryError::UnknownDomain {
                domain: domain.to_string(),
            })
    }

    fn domain_analysis(&self, domain: &str, metrics: &[String]) -> Result<Value, QueryError> {
        let snapshot = self.snapshot(domain)?;
        // Empty metric list means "all metrics"; otherwise return only the
        // requested fields.
        let selected: HashMap<&str, f64> = if metrics.is_empty() {
            snapshot.metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect()
        } else {
            metrics
                .iter()
                .filter_map(|name| {
                    snapshot
                        .metrics
                        .get(name)
                        .map(|value| (name.as_str(), *value))
                })
                .collect()
        };
        Ok(json!({
            "domain": snapshot.domain,
            "metrics": selected,
            "summary": snapshot.summary,
            "updated_at": snapshot.updated_at,
        }))
    }

    fn cross_domain(&self, domains: &[String]) -> Result<Value, QueryError> {
        let snapshots: Vec<DomainSnapshot> = domains
            .iter()
            .map(|d| self.snapshot(d))
            .collect::<Result<_, _>>()?;

        // Metrics present in every requested domain.
        let mut shared: Vec<&String> = snapshots[0].metrics.keys().collect();
        for snapshot in &snapshots[1..] {
            shared.retain(|name| snapshot.metrics.contains_key(*name));
        }
        shared.sort();

        let per_metric: Vec<Value> = shared
            .iter()
            .map(|name| {
                let values: HashMap<&str, f64> = snapshots
                    .iter()
                    .map(|s| (s.domain.as_str(), s.metrics[*name]))
                    .collect();
                json!({ "metric": name, "values": values })
            })
            .collect();

        Ok(json!({
            "domains": domains,
            "shared_metrics": per_metric,
        }))
    }

    fn comparative(&self, domains: &[String], metric: &str) -> Result<Value, QueryError> {
        let mut ranking: Vec<(String, f64)> = Vec::with_capacity(domains.len());
        for domain in domains {
            let snapshot = self.snapshot(domain)?;
            let value = snapshot.metrics.get(metric).copied().ok_or_else(|| {
                QueryError::InvalidParameters {
                    reason: format!("domain {domain} has no metric {metric}"),
                }
            })?;
            ranking.push((domain.clone(), value));
        }
        ranking.sort_by(|a, b| b.1.total_cmp(&a.1));

        let entries: Vec<Value> = ranking
            .iter()
            .enumerate()
            .map(|(rank, (domain, value))| {
                json!({ "rank": rank + 1, "domain": domain, "value": value })
            })
            .collect();
        Ok(json!({ "metric": metric, "ranking": entries }))
    }
}

#[async_trait]
impl QueryResolver for SnapshotResolver {
    async fn resolve(&self, query: &Query) -> Result<Value, QueryError> {
        match &query.spec {
            QuerySpec::DomainAnalysis { domain, metrics } => {
                self.domain_analysis(domain, metrics)
            }
            QuerySpec::CrossDomain { domains } => {
                if domains.is_empty() {
                    return Err(QueryError::InvalidParameters {
                        reason: "cross_domain requires at least one domain".to_string(),
                    });
                }
                self.cross_domain(domains)
            }
            QuerySpec::Comparative { domains, metric } => self.comparative(domains, metric),
            QuerySpec::Historical { .. } => Err(QueryError::Unsupported {
                reason: "snapshot resolver keeps no history".to_string(),
            }),
            QuerySpec::Predictive { .. } => Err(QueryError::Unsupported {
                reason: "snapshot resolver does not project forward".to_string(),
            }),
            QuerySpec::Custom { name, .. } => Err(QueryError::Unsupported {
                reason: format!("unknown custom query: {name}"),
            }),
        }
    }
}
