//! The immutable unit of distribution.
//!
//! Analyzers produce an [`AnalysisEvent`] when a unit of analysis completes.
//! Events are created once, fanned out to every interested consumer, and
//! never mutated. The bus keeps no replay log; once dispatched an event is
//! gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Category of an analysis event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AnalysisComplete,
    DomainUpdate,
    RiskAlert,
    OpportunityAlert,
    MetricChange,
    CrossDomainInsight,
    BatchComplete,
    ThresholdExceeded,
}

impl EventType {
    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AnalysisComplete => "analysis_complete",
            EventType::DomainUpdate => "domain_update",
            EventType::RiskAlert => "risk_alert",
            EventType::OpportunityAlert => "opportunity_alert",
            EventType::MetricChange => "metric_change",
            EventType::CrossDomainInsight => "cross_domain_insight",
            EventType::BatchComplete => "batch_complete",
            EventType::ThresholdExceeded => "threshold_exceeded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete analysis result emitted by an upstream analyzer.
///
/// `event_id` is a UUIDv7, so ids sort roughly by creation time and are
/// unique enough for consumer-side dedup. `domain` is `None` for global
/// events, which are delivered to every live connection regardless of
/// channel subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl AnalysisEvent {
    /// Create a new event stamped with a fresh UUIDv7 and the current time.
    pub fn new(event_type: EventType, domain: Option<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            domain,
            timestamp: Utc::now(),
            payload,
            confidence: None,
        }
    }

    /// Attach a confidence score, clamped to `0.0..=1.0`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Global events carry no domain tag and reach every connection.
    pub fn is_global(&self) -> bool {
        self.domain.is_none()
    }
}
