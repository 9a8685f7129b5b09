//! Structured query descriptors.
//!
//! The query surface is a tagged union over `query_type`: each type carries
//! its own strongly-typed parameter shape, so malformed parameter maps are
//! rejected at deserialization instead of deep inside a worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One query inside a batch. Higher `priority` dispatches first when
/// parallelism is constrained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    #[serde(default = "Uuid::new_v4")]
    pub query_id: Uuid,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub spec: QuerySpec,
}

impl Query {
    pub fn new(spec: QuerySpec, priority: i32) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            priority,
            spec,
        }
    }

    /// Boundary validation; malformed queries never enter a queue.
    pub fn validate(&self) -> Result<(), String> {
        match &self.spec {
            QuerySpec::DomainAnalysis { domain, .. } => {
                if domain.is_empty() {
                    return Err("domain_analysis requires a domain".to_string());
                }
            }
            QuerySpec::CrossDomain { domains } => {
                if domains.len() < 2 {
                    return Err("cross_domain requires at least two domains".to_string());
                }
            }
            QuerySpec::Comparative { domains, metric } => {
                if domains.len() < 2 {
                    return Err("comparative requires at least two domains".to_string());
                }
                if metric.is_empty() {
                    return Err("comparative requires a metric".to_string());
                }
            }
            QuerySpec::Historical { domain, window_days } => {
                if domain.is_empty() {
                    return Err("historical requires a domain".to_string());
                }
                if *window_days == 0 {
                    return Err("historical window must be at least one day".to_string());
                }
            }
            QuerySpec::Predictive { domain, horizon_days } => {
                if domain.is_empty() {
                    return Err("predictive requires a domain".to_string());
                }
                if *horizon_days == 0 {
                    return Err("predictive horizon must be at least one day".to_string());
                }
            }
            QuerySpec::Custom { name, .. } => {
                if name.is_empty() {
                    return Err("custom query requires a name".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Typed parameter shapes, tagged by `query_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query_type", rename_all = "snake_case")]
pub enum QuerySpec {
    DomainAnalysis {
        domain: String,
        #[serde(default)]
        metrics: Vec<String>,
    },
    CrossDomain {
        domains: Vec<String>,
    },
    Comparative {
        domains: Vec<String>,
        metric: String,
    },
    Historical {
        domain: String,
        window_days: u32,
    },
    Predictive {
        domain: String,
        horizon_days: u32,
    },
    Custom {
        name: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
}

impl QuerySpec {
    pub fn query_type(&self) -> &'static str {
        match self {
            QuerySpec::DomainAnalysis { .. } => "domain_analysis",
            QuerySpec::CrossDomain { .. } => "cross_domain",
            QuerySpec::Comparative { .. } => "comparative",
            QuerySpec::Historical { .. } => "historical",
            QuerySpec::Predictive { .. } => "predictive",
            QuerySpec::Custom { .. } => "custom",
        }
    }

    /// The single domain a query targets, when it targets exactly one.
    pub fn domain(&self) -> Option<&str> {
        match self {
            QuerySpec::DomainAnalysis { domain, .. }
            | QuerySpec::Historical { domain, .. }
            | QuerySpec::Predictive { domain, .. } => Some(domain),
            _ => None,
        }
    }
}
