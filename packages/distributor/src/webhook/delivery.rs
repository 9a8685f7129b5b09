//! Delivery attempt records, history, and retry backoff.
//!
//! Every attempt to deliver one event to one subscription is recorded and
//! ends in a terminal status; nothing is silently lost. History is kept
//! in-memory per subscription, most-recent-first on read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::event::AnalysisEvent;

/// Lifecycle of a single delivery attempt.
///
/// `Exhausted` marks the final attempt of a chain that used up its retry
/// budget; the `(subscription_id, event_id)` pair will not be retried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Exhausted,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Exhausted)
    }
}

/// One attempt to deliver one event to one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub delivery_id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeliveryAttempt {
    pub fn pending(subscription_id: Uuid, event_id: Uuid, attempt_number: u32) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            subscription_id,
            event_id,
            attempt_number,
            status: DeliveryStatus::Pending,
            scheduled_at: Utc::now(),
            last_error: None,
        }
    }
}

/// The canonical JSON body POSTed to a webhook target.
#[derive(Debug, Serialize)]
pub struct DeliveryEnvelope<'a> {
    pub event: &'a AnalysisEvent,
    pub subscription_id: Uuid,
    pub delivery_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// In-memory delivery history, keyed by subscription.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    entries: std::sync::Arc<DashMap<Uuid, Vec<DeliveryAttempt>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new attempt record.
    pub fn record(&self, attempt: DeliveryAttempt) {
        self.entries
            .entry(attempt.subscription_id)
            .or_default()
            .push(attempt);
    }

    /// Update the status of a recorded attempt.
    pub fn resolve(
        &self,
        subscription_id: Uuid,
        delivery_id: Uuid,
        status: DeliveryStatus,
        last_error: Option<String>,
    ) {
        if let Some(mut attempts) = self.entries.get_mut(&subscription_id) {
            if let Some(attempt) = attempts
                .iter_mut()
                .find(|a| a.delivery_id == delivery_id)
            {
                attempt.status = status;
                attempt.last_error = last_error;
            }
        }
    }

    /// Delivery history for a subscription, most-recent-first.
    pub fn for_subscription(&self, subscription_id: Uuid) -> Vec<DeliveryAttempt> {
        self.entries
            .get(&subscription_id)
            .map(|attempts| attempts.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of attempts recorded for one `(subscription, event)` pair.
    pub fn attempts_for(&self, subscription_id: Uuid, event_id: Uuid) -> u32 {
        self.entries
            .get(&subscription_id)
            .map(|attempts| {
                attempts
                    .iter()
                    .filter(|a| a.event_id == event_id)
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

/// Exponential backoff with jitter: `base * 2^(n-1) ± 20%`, capped at `max`.
///
/// `attempt_number` is the attempt that just failed (1-based).
pub fn backoff_delay(attempt_number: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt_number.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent));
    let capped = scaled.min(max);

    let jitter_factor = rand::thread_rng().gen_range(-0.2..=0.2);
    let with_jitter = capped.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(with_jitter.max(0.0)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_starts_pending() {
        let attempt = DeliveryAttempt::pending(Uuid::new_v4(), Uuid::new_v4(), 1);
        assert_eq!(attempt.status, DeliveryStatus::Pending);
        assert!(!attempt.status.is_terminal());
        assert!(attempt.last_error.is_none());
    }

    #[test]
    fn success_and_exhausted_are_terminal() {
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Exhausted.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn history_is_most_recent_first() {
        let log = DeliveryLog::new();
        let sub = Uuid::new_v4();

        for n in 1..=3 {
            log.record(DeliveryAttempt::pending(sub, Uuid::new_v4(), n));
        }

        let history = log.for_subscription(sub);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].attempt_number, 3);
        assert_eq!(history[2].attempt_number, 1);
    }

    #[test]
    fn resolve_updates_the_right_attempt() {
        let log = DeliveryLog::new();
        let sub = Uuid::new_v4();
        let event = Uuid::new_v4();

        let first = DeliveryAttempt::pending(sub, event, 1);
        let first_id = first.delivery_id;
        log.record(first);
        log.record(DeliveryAttempt::pending(sub, event, 2));

        log.resolve(
            sub,
            first_id,
            DeliveryStatus::Failed,
            Some("connection refused".to_string()),
        );

        let history = log.for_subscription(sub);
        let resolved = history.iter().find(|a| a.delivery_id == first_id).unwrap();
        assert_eq!(resolved.status, DeliveryStatus::Failed);
        assert_eq!(resolved.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn attempts_for_counts_per_event_pair() {
        let log = DeliveryLog::new();
        let sub = Uuid::new_v4();
        let event_a = Uuid::new_v4();
        let event_b = Uuid::new_v4();

        log.record(DeliveryAttempt::pending(sub, event_a, 1));
        log.record(DeliveryAttempt::pending(sub, event_a, 2));
        log.record(DeliveryAttempt::pending(sub, event_b, 1));

        assert_eq!(log.attempts_for(sub, event_a), 2);
        assert_eq!(log.attempts_for(sub, event_b), 1);
        assert_eq!(log.attempts_for(Uuid::new_v4(), event_a), 0);
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);

        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, base, max);
            assert!(delay <= max, "attempt {attempt} exceeded cap: {delay:?}");
        }

        // Attempt 1 jitters around the base; attempt 4 around 8x base.
        let first = backoff_delay(1, base, max);
        assert!(first >= Duration::from_millis(400));
        assert!(first <= Duration::from_millis(600));

        let fourth = backoff_delay(4, base, max);
        assert!(fourth >= Duration::from_millis(3200));
        assert!(fourth <= Duration::from_millis(4800));
    }

    #[test]
    fn envelope_serializes_canonically() {
        let event = crate::event::AnalysisEvent::new(
            crate::event::EventType::RiskAlert,
            Some("market".to_string()),
            serde_json::json!({ "score": 0.9 }),
        );
        let envelope = DeliveryEnvelope {
            event: &event,
            subscription_id: Uuid::new_v4(),
            delivery_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event"]["event_type"], "risk_alert");
        assert!(value.get("subscription_id").is_some());
        assert!(value.get("delivery_id").is_some());
        assert!(value.get("timestamp").is_some());
    }
}
