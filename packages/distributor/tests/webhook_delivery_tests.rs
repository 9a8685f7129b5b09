//! End-to-end webhook delivery tests against a mock HTTP endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use distributor::webhook::signature::{verify_signature, SIGNATURE_HEADER};
use distributor::webhook::{DeliveryStatus, WebhookConfig, WebhookDispatcher};
use distributor::{AnalysisEvent, EventType};

fn fast_config(max_attempts: u32) -> WebhookConfig {
    WebhookConfig {
        workers: 2,
        max_attempts,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn event(event_type: EventType, domain: Option<&str>) -> Arc<AnalysisEvent> {
    Arc::new(AnalysisEvent::new(
        event_type,
        domain.map(|d| d.to_string()),
        json!({ "metric": "growth", "value": 0.42 }),
    ))
}

async fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn delivery_is_signed_with_the_subscription_secret() {
    let server = MockServer::start();
    const SECRET: &str = "s3cret";
    let secret = SECRET;
    let mock = server.mock(|when, then| {
        when.method(POST).path("/hook").matches(|req| {
            let body = req.body.clone().unwrap_or_default();
            let header = req
                .headers
                .clone()
                .unwrap_or_default()
                .into_iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
                .map(|(_, value)| value);
            header.is_some_and(|h| verify_signature(&body, &h, SECRET.as_bytes()))
        });
        then.status(200);
    });

    let dispatcher = WebhookDispatcher::start(fast_config(3));
    let subscription = dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::new(),
            HashSet::new(),
            secret.to_string(),
        )
        .unwrap();

    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("market")))
        .await;

    let d = dispatcher.clone();
    wait_for("signed delivery", move || d.stats().succeeded == 1).await;
    mock.assert();

    let attempts = dispatcher.list_deliveries(subscription.id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, DeliveryStatus::Success);
    assert_eq!(attempts[0].attempt_number, 1);
}

#[tokio::test]
async fn failing_endpoint_exhausts_after_max_attempts() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(500);
    });

    let dispatcher = WebhookDispatcher::start(fast_config(3));
    let subscription = dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::new(),
            HashSet::new(),
            "secret".to_string(),
        )
        .unwrap();

    dispatcher
        .handle_event(event(EventType::MetricChange, Some("market")))
        .await;

    let d = dispatcher.clone();
    wait_for("delivery exhaustion", move || d.stats().exhausted == 1).await;

    // Exactly max_attempts requests, not one more.
    assert_eq!(mock.hits(), 3);

    let attempts = dispatcher.list_deliveries(subscription.id).unwrap();
    assert_eq!(attempts.len(), 3);
    // Most-recent-first: the final attempt is exhausted, earlier ones failed.
    assert_eq!(attempts[0].status, DeliveryStatus::Exhausted);
    assert!(attempts[0].last_error.is_some());
    assert!(attempts[1..]
        .iter()
        .all(|a| a.status == DeliveryStatus::Failed));
}

#[tokio::test]
async fn recovery_mid_chain_ends_with_success() {
    let server = MockServer::start();
    let mut failing = server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(503);
    });

    let config = WebhookConfig {
        base_backoff: Duration::from_millis(400),
        max_backoff: Duration::from_millis(400),
        ..fast_config(5)
    };
    let dispatcher = WebhookDispatcher::start(config);
    dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::new(),
            HashSet::new(),
            "secret".to_string(),
        )
        .unwrap();

    dispatcher
        .handle_event(event(EventType::AnalysisComplete, None))
        .await;

    // Let the first attempt fail, then bring the endpoint back up during
    // the backoff window.
    let d = dispatcher.clone();
    wait_for("first failed attempt", move || {
        d.stats().failed_attempts >= 1
    })
    .await;
    failing.delete();
    server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(200);
    });

    let d = dispatcher.clone();
    wait_for("eventual success", move || d.stats().succeeded == 1).await;
    assert_eq!(dispatcher.stats().exhausted, 0);
}

#[tokio::test]
async fn filters_select_matching_subscriptions_only() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/env-risk");
        then.status(200);
    });

    let dispatcher = WebhookDispatcher::start(fast_config(3));
    dispatcher
        .register_subscription(
            &server.url("/env-risk"),
            HashSet::from([EventType::RiskAlert]),
            HashSet::from(["environmental".to_string()]),
            "secret".to_string(),
        )
        .unwrap();

    // Wrong type, wrong domain, then the one that matches.
    dispatcher
        .handle_event(event(EventType::MetricChange, Some("environmental")))
        .await;
    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("market")))
        .await;
    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("environmental")))
        .await;

    let d = dispatcher.clone();
    wait_for("matching delivery", move || d.stats().succeeded == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mock.hits(), 1);
    assert_eq!(dispatcher.stats().enqueued, 1);
}

#[tokio::test]
async fn test_delivery_records_independent_attempts() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/hook").body_contains("\"test\":true");
        then.status(200);
    });

    let dispatcher = WebhookDispatcher::start(fast_config(3));
    let subscription = dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::from([EventType::RiskAlert]),
            HashSet::new(),
            "secret".to_string(),
        )
        .unwrap();

    let first = dispatcher.test_delivery(subscription.id).await.unwrap();
    let second = dispatcher.test_delivery(subscription.id).await.unwrap();

    assert_eq!(first.status, DeliveryStatus::Success);
    assert_eq!(second.status, DeliveryStatus::Success);
    assert_ne!(first.delivery_id, second.delivery_id);
    assert_eq!(mock.hits(), 2);

    // Test deliveries never touch the active flag.
    assert!(dispatcher.get_subscription(subscription.id).unwrap().active);
}

#[tokio::test]
async fn overloaded_queue_leaves_no_delivery_unaccounted() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(200).delay(Duration::from_secs(1));
    });

    // One slow worker, a queue of one: back-to-back events must overflow.
    let config = WebhookConfig {
        workers: 1,
        queue_capacity: 1,
        ..fast_config(1)
    };
    let dispatcher = WebhookDispatcher::start(config);
    let subscription = dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::new(),
            HashSet::new(),
            "secret".to_string(),
        )
        .unwrap();

    let events: Vec<_> = (0..3)
        .map(|_| event(EventType::RiskAlert, Some("market")))
        .collect();
    for e in &events {
        dispatcher.handle_event(e.clone()).await;
    }
    assert!(dispatcher.stats().dropped_tasks >= 1);

    // Every matched event has a delivery record, dropped tasks included.
    let history = dispatcher.list_deliveries(subscription.id).unwrap();
    for e in &events {
        assert!(
            history.iter().any(|a| a.event_id == e.event_id),
            "no delivery record for event {}",
            e.event_id
        );
    }

    let dropped: Vec<_> = history
        .iter()
        .filter(|a| a.last_error.as_deref() == Some("delivery queue full"))
        .collect();
    assert_eq!(dropped.len() as u64, dispatcher.stats().dropped_tasks);
    assert!(dropped.iter().all(|a| a.status == DeliveryStatus::Exhausted));
}

#[tokio::test]
async fn backoff_of_one_subscription_does_not_starve_others() {
    let server = MockServer::start();
    let failing = server.mock(|when, then| {
        when.method(POST).path("/failing");
        then.status(500);
    });
    let healthy = server.mock(|when, then| {
        when.method(POST).path("/healthy");
        then.status(200);
    });

    // One worker; the failing chain sits in a backoff window far longer
    // than the test. The healthy delivery must still get through.
    let config = WebhookConfig {
        workers: 1,
        max_attempts: 3,
        base_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
        ..WebhookConfig::default()
    };
    let dispatcher = WebhookDispatcher::start(config);
    dispatcher
        .register_subscription(
            &server.url("/failing"),
            HashSet::new(),
            HashSet::from(["alpha".to_string()]),
            "secret".to_string(),
        )
        .unwrap();
    dispatcher
        .register_subscription(
            &server.url("/healthy"),
            HashSet::new(),
            HashSet::from(["beta".to_string()]),
            "secret".to_string(),
        )
        .unwrap();

    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("alpha")))
        .await;
    let d = dispatcher.clone();
    wait_for("first failed attempt", move || {
        d.stats().failed_attempts >= 1
    })
    .await;

    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("beta")))
        .await;
    let d = dispatcher.clone();
    wait_for("healthy delivery", move || d.stats().succeeded == 1).await;

    healthy.assert();
    assert_eq!(failing.hits(), 1);
    assert_eq!(dispatcher.stats().exhausted, 0);
}

#[tokio::test]
async fn removed_subscription_receives_no_further_deliveries() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(200);
    });

    let dispatcher = WebhookDispatcher::start(fast_config(3));
    let subscription = dispatcher
        .register_subscription(
            &server.url("/hook"),
            HashSet::new(),
            HashSet::new(),
            "secret".to_string(),
        )
        .unwrap();

    dispatcher.remove_subscription(subscription.id).unwrap();
    dispatcher
        .handle_event(event(EventType::RiskAlert, Some("market")))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mock.hits(), 0);
    // History stays queryable after deactivation.
    assert!(dispatcher.list_deliveries(subscription.id).is_ok());
}
