//! Webhook subscription records and their registry.
//!
//! Subscriptions are durable for the life of the process and soft-deleted:
//! removal clears the `active` flag but keeps the record, because delivery
//! history references it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::error::DistributionError;
use crate::event::{AnalysisEvent, EventType};

/// A registered webhook endpoint.
///
/// Empty `event_types` or `domain_filter` means "match all" for that axis.
/// The secret signs delivery bodies and is never serialized outward.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub target_url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub event_types: HashSet<EventType>,
    pub domain_filter: HashSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Filter evaluation: event type in `event_types` (or empty), domain in
    /// `domain_filter` (or empty). Inactive subscriptions never match.
    /// A global event fails a non-empty domain filter.
    pub fn matches(&self, event: &AnalysisEvent) -> bool {
        if !self.active {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.domain_filter.is_empty() {
            match &event.domain {
                Some(domain) => {
                    if !self.domain_filter.contains(domain) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Concurrency-safe registry of webhook subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    subscriptions: std::sync::Arc<DashMap<Uuid, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription after validating the target URL shape.
    ///
    /// The endpoint is not probed; use `test_delivery` for an explicit
    /// reachability check.
    pub fn register(
        &self,
        target_url: &str,
        event_types: HashSet<EventType>,
        domain_filter: HashSet<String>,
        secret: String,
    ) -> Result<Subscription, DistributionError> {
        let url = Url::parse(target_url)
            .map_err(|e| DistributionError::InvalidWebhookUrl(format!("{target_url}: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DistributionError::InvalidWebhookUrl(format!(
                "{target_url}: scheme must be http or https"
            )));
        }
        if url.host_str().is_none() {
            return Err(DistributionError::InvalidWebhookUrl(format!(
                "{target_url}: missing host"
            )));
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            target_url: url.to_string(),
            secret,
            event_types,
            domain_filter,
            active: true,
            created_at: Utc::now(),
        };
        info!(
            subscription_id = %subscription.id,
            target_url = %subscription.target_url,
            "webhook subscription registered"
        );
        self.subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    /// Soft-delete: mark inactive so no further attempts are scheduled.
    /// In-flight attempt chains finish naturally.
    pub fn remove(&self, id: Uuid) -> Result<(), DistributionError> {
        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or(DistributionError::SubscriptionNotFound(id))?;
        entry.active = false;
        info!(subscription_id = %id, "webhook subscription deactivated");
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Subscription> {
        self.subscriptions.get(&id).map(|entry| entry.clone())
    }

    /// All subscriptions, active and inactive.
    pub fn list(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|entry| entry.clone())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Active subscriptions whose filters match the event.
    pub fn matching(&self, event: &AnalysisEvent) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.matches(event))
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(
        event_types: &[EventType],
        domains: &[&str],
    ) -> (SubscriptionRegistry, Subscription) {
        let registry = SubscriptionRegistry::new();
        let sub = registry
            .register(
                "https://example.com/hook",
                event_types.iter().copied().collect(),
                domains.iter().map(|d| d.to_string()).collect(),
                "secret".to_string(),
            )
            .unwrap();
        (registry, sub)
    }

    fn event(event_type: EventType, domain: Option<&str>) -> AnalysisEvent {
        AnalysisEvent::new(event_type, domain.map(|d| d.to_string()), json!({}))
    }

    #[test]
    fn rejects_malformed_urls() {
        let registry = SubscriptionRegistry::new();
        for bad in ["not a url", "ftp://example.com/hook", "https://"] {
            let err = registry
                .register(bad, HashSet::new(), HashSet::new(), "s".to_string())
                .unwrap_err();
            assert!(matches!(err, DistributionError::InvalidWebhookUrl(_)), "{bad}");
        }
    }

    #[test]
    fn empty_filters_match_everything_scoped() {
        let (_registry, sub) = registry_with(&[], &[]);
        assert!(sub.matches(&event(EventType::RiskAlert, Some("market"))));
        assert!(sub.matches(&event(EventType::MetricChange, None)));
    }

    #[test]
    fn event_type_filter_excludes_other_types() {
        let (_registry, sub) = registry_with(&[EventType::RiskAlert], &[]);
        assert!(sub.matches(&event(EventType::RiskAlert, Some("market"))));
        assert!(!sub.matches(&event(EventType::MetricChange, Some("market"))));
    }

    #[test]
    fn domain_filter_with_empty_types_matches_all_types_in_domain() {
        let (_registry, sub) = registry_with(&[], &["environmental"]);
        assert!(sub.matches(&event(EventType::RiskAlert, Some("environmental"))));
        assert!(sub.matches(&event(EventType::MetricChange, Some("environmental"))));
        assert!(!sub.matches(&event(EventType::RiskAlert, Some("market"))));
        // Global events fail a non-empty domain filter.
        assert!(!sub.matches(&event(EventType::RiskAlert, None)));
    }

    #[test]
    fn inactive_subscription_never_matches() {
        let (registry, sub) = registry_with(&[], &[]);
        registry.remove(sub.id).unwrap();

        let sub = registry.get(sub.id).unwrap();
        assert!(!sub.active);
        assert!(!sub.matches(&event(EventType::RiskAlert, Some("market"))));
    }

    #[test]
    fn removal_is_soft() {
        let (registry, sub) = registry_with(&[], &[]);
        registry.remove(sub.id).unwrap();

        // Record survives for delivery history.
        assert_eq!(registry.len(), 1);
        assert!(registry.get(sub.id).is_some());
    }

    #[test]
    fn remove_unknown_subscription_errors() {
        let registry = SubscriptionRegistry::new();
        let err = registry.remove(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DistributionError::SubscriptionNotFound(_)));
    }

    #[test]
    fn matching_returns_only_matching_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let risk = registry
            .register(
                "https://example.com/risk",
                [EventType::RiskAlert].into_iter().collect(),
                HashSet::new(),
                "s".to_string(),
            )
            .unwrap();
        registry
            .register(
                "https://example.com/metrics",
                [EventType::MetricChange].into_iter().collect(),
                HashSet::new(),
                "s".to_string(),
            )
            .unwrap();

        let matched = registry.matching(&event(EventType::RiskAlert, Some("market")));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, risk.id);
    }

    #[test]
    fn secret_is_not_serialized() {
        let (_registry, sub) = registry_with(&[], &[]);
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert!(json.get("target_url").is_some());
    }
}
