//! Webhook delivery dispatcher and worker pool.
//!
//! # Architecture
//!
//! ```text
//! EventBus ──► spawn_intake task
//!                  │ evaluates filters, records a pending attempt per match
//!                  ▼
//!            bounded task queue
//!                  │
//!          ┌───────┴────────┐
//!       worker 1 ... worker N
//!          │
//!          ├─► acquire subscription delivery token
//!          ├─► POST signed envelope (first attempt)
//!          └─► on failure, hand the chain to a detached retry task
//! ```
//!
//! A subscription's delivery token is held for the whole attempt chain of
//! one event, so retries never overlap and a later event for the same
//! subscription queues behind the earlier chain. Independent subscriptions
//! deliver concurrently. Backoff sleeps and retries run off the worker
//! pool: the token guard moves into a detached task, so a failing endpoint
//! never occupies a pool slot while it waits.
//!
//! Every matched `(subscription, event)` pair gets a delivery record at
//! enqueue time and ends in a terminal status, a full task queue included.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DistributionError;
use crate::event::{AnalysisEvent, EventType};
use crate::webhook::delivery::{
    backoff_delay, DeliveryAttempt, DeliveryEnvelope, DeliveryLog, DeliveryStatus,
};
use crate::webhook::signature::{compute_signature, format_signature_header, SIGNATURE_HEADER};
use crate::webhook::subscription::{Subscription, SubscriptionRegistry};

/// Tuning knobs for the delivery subsystem.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Number of delivery workers.
    pub workers: usize,
    /// Depth of the shared delivery task queue.
    pub queue_capacity: usize,
    /// Maximum attempts per `(subscription, event)` pair.
    pub max_attempts: u32,
    /// First retry delay; doubles each attempt.
    pub base_backoff: Duration,
    /// Retry delay cap.
    pub max_backoff: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct DeliveryTask {
    subscription_id: Uuid,
    // Pending record created at enqueue time; the first attempt resolves it.
    delivery_id: Uuid,
    event: Arc<AnalysisEvent>,
}

#[derive(Default)]
struct DispatchCounters {
    enqueued: AtomicU64,
    dropped_tasks: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookStats {
    pub enqueued: u64,
    pub dropped_tasks: u64,
    pub succeeded: u64,
    pub failed_attempts: u64,
    pub exhausted: u64,
}

struct DispatcherInner {
    subscriptions: SubscriptionRegistry,
    log: DeliveryLog,
    config: WebhookConfig,
    http: reqwest::Client,
    // Per-subscription delivery token; serializes attempt chains.
    tokens: DashMap<Uuid, Arc<Mutex<()>>>,
    counters: DispatchCounters,
}

/// Owns webhook subscriptions, delivery history, and the worker pool.
///
/// Cloneable handle; workers stop when every handle is dropped (the task
/// channel closes).
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<DispatcherInner>,
    task_tx: mpsc::Sender<DeliveryTask>,
}

impl WebhookDispatcher {
    /// Spawn the worker pool and return a dispatcher handle.
    pub fn start(config: WebhookConfig) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<DeliveryTask>(config.queue_capacity.max(1));
        let workers = config.workers.max(1);

        let inner = Arc::new(DispatcherInner {
            subscriptions: SubscriptionRegistry::new(),
            log: DeliveryLog::new(),
            config,
            http: reqwest::Client::new(),
            tokens: DashMap::new(),
            counters: DispatchCounters::default(),
        });

        let shared_rx = Arc::new(Mutex::new(task_rx));
        for worker_id in 0..workers {
            let inner = inner.clone();
            let rx = shared_rx.clone();
            tokio::spawn(async move {
                debug!(worker_id, "delivery worker started");
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };
                    let token = subscription_token(&inner, task.subscription_id);
                    match token.clone().try_lock_owned() {
                        Ok(held) => first_attempt(inner.clone(), task, held).await,
                        // An earlier chain for this subscription is still in
                        // flight; wait for the token off the pool so other
                        // subscriptions keep draining.
                        Err(_) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                let held = token.lock_owned().await;
                                first_attempt(inner, task, held).await;
                            });
                        }
                    }
                }
                debug!(worker_id, "delivery worker stopped");
            });
        }

        Self { inner, task_tx }
    }

    /// Register a webhook subscription. Validates the URL shape only.
    pub fn register_subscription(
        &self,
        target_url: &str,
        event_types: std::collections::HashSet<EventType>,
        domain_filter: std::collections::HashSet<String>,
        secret: String,
    ) -> Result<Subscription, DistributionError> {
        self.inner
            .subscriptions
            .register(target_url, event_types, domain_filter, secret)
    }

    /// Deactivate a subscription. In-flight attempt chains finish naturally.
    pub fn remove_subscription(&self, id: Uuid) -> Result<(), DistributionError> {
        self.inner.subscriptions.remove(id)
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<Subscription> {
        self.inner.subscriptions.get(id)
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.list()
    }

    /// Delivery history for a subscription, most-recent-first.
    pub fn list_deliveries(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>, DistributionError> {
        if self.inner.subscriptions.get(id).is_none() {
            return Err(DistributionError::SubscriptionNotFound(id));
        }
        Ok(self.inner.log.for_subscription(id))
    }

    /// Evaluate filters for one event and enqueue delivery tasks.
    ///
    /// Each match gets a pending delivery record before the enqueue, so a
    /// full task queue still leaves a terminal record behind.
    pub async fn handle_event(&self, event: Arc<AnalysisEvent>) {
        for subscription in self.inner.subscriptions.matching(&event) {
            let attempt = DeliveryAttempt::pending(subscription.id, event.event_id, 1);
            let delivery_id = attempt.delivery_id;
            self.inner.log.record(attempt);

            let task = DeliveryTask {
                subscription_id: subscription.id,
                delivery_id,
                event: event.clone(),
            };
            match self.task_tx.try_send(task) {
                Ok(()) => {
                    self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.inner
                        .counters
                        .dropped_tasks
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.log.resolve(
                        subscription.id,
                        delivery_id,
                        DeliveryStatus::Exhausted,
                        Some("delivery queue full".to_string()),
                    );
                    warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.event_id,
                        "delivery queue full, dropping task"
                    );
                }
            }
        }
    }

    /// Bridge a bus receiver into the dispatcher.
    pub fn spawn_intake(
        &self,
        mut rx: mpsc::Receiver<Arc<AnalysisEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            info!("webhook intake started");
            while let Some(event) = rx.recv().await {
                dispatcher.handle_event(event).await;
            }
            info!("webhook intake stopped");
        })
    }

    /// Send a synthetic event to one subscription, bypassing filters.
    ///
    /// Exactly one attempt, no retries. Each call produces an independent
    /// delivery record and never touches the `active` flag.
    pub async fn test_delivery(&self, id: Uuid) -> Result<DeliveryAttempt, DistributionError> {
        let subscription = self
            .inner
            .subscriptions
            .get(id)
            .ok_or(DistributionError::SubscriptionNotFound(id))?;

        let event = Arc::new(AnalysisEvent::new(
            EventType::AnalysisComplete,
            None,
            serde_json::json!({ "test": true, "subscription_id": id }),
        ));

        let token = subscription_token(&self.inner, id);
        let _held = token.lock().await;

        let mut attempt = DeliveryAttempt::pending(id, event.event_id, 1);
        self.inner.log.record(attempt.clone());

        match attempt_once(&self.inner, &subscription, &event, attempt.delivery_id).await {
            Ok(()) => {
                attempt.status = DeliveryStatus::Success;
                self.inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                attempt.status = DeliveryStatus::Failed;
                attempt.last_error = Some(error);
                self.inner
                    .counters
                    .failed_attempts
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.log.resolve(
            id,
            attempt.delivery_id,
            attempt.status,
            attempt.last_error.clone(),
        );
        Ok(attempt)
    }

    pub fn stats(&self) -> WebhookStats {
        let c = &self.inner.counters;
        WebhookStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped_tasks: c.dropped_tasks.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
        }
    }
}

fn subscription_token(inner: &DispatcherInner, id: Uuid) -> Arc<Mutex<()>> {
    inner
        .tokens
        .entry(id)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// First attempt of a chain, run on a worker.
///
/// On failure the remaining attempts move to a detached task; the token
/// guard moves with them, so the chain stays serialized while the worker
/// goes back to the queue.
async fn first_attempt(
    inner: Arc<DispatcherInner>,
    task: DeliveryTask,
    held: OwnedMutexGuard<()>,
) {
    // The subscription may have been deactivated while the task was queued.
    let subscription = match inner.subscriptions.get(task.subscription_id) {
        Some(sub) if sub.active => sub,
        _ => {
            inner.log.resolve(
                task.subscription_id,
                task.delivery_id,
                DeliveryStatus::Exhausted,
                Some("subscription deactivated before delivery".to_string()),
            );
            debug!(
                subscription_id = %task.subscription_id,
                event_id = %task.event.event_id,
                "skipping delivery for inactive subscription"
            );
            return;
        }
    };

    if settle_attempt(&inner, &subscription, &task.event, task.delivery_id, 1).await {
        return;
    }
    tokio::spawn(retry_chain(inner, subscription, task.event, held));
}

/// Attempts `2..=max_attempts` with backoff between them.
async fn retry_chain(
    inner: Arc<DispatcherInner>,
    subscription: Subscription,
    event: Arc<AnalysisEvent>,
    _held: OwnedMutexGuard<()>,
) {
    for attempt_number in 2..=inner.config.max_attempts {
        let delay = backoff_delay(
            attempt_number - 1,
            inner.config.base_backoff,
            inner.config.max_backoff,
        );
        debug!(
            subscription_id = %subscription.id,
            event_id = %event.event_id,
            attempt_number,
            delay_ms = delay.as_millis() as u64,
            "waiting out delivery backoff"
        );
        tokio::time::sleep(delay).await;

        let attempt = DeliveryAttempt::pending(subscription.id, event.event_id, attempt_number);
        let delivery_id = attempt.delivery_id;
        inner.log.record(attempt);

        if settle_attempt(&inner, &subscription, &event, delivery_id, attempt_number).await {
            return;
        }
    }
}

/// Run one attempt and resolve its record. Returns `true` when the chain
/// is done (success or retry budget used up).
async fn settle_attempt(
    inner: &DispatcherInner,
    subscription: &Subscription,
    event: &AnalysisEvent,
    delivery_id: Uuid,
    attempt_number: u32,
) -> bool {
    match attempt_once(inner, subscription, event, delivery_id).await {
        Ok(()) => {
            inner
                .log
                .resolve(subscription.id, delivery_id, DeliveryStatus::Success, None);
            inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(
                subscription_id = %subscription.id,
                event_id = %event.event_id,
                attempt_number,
                "delivery succeeded"
            );
            true
        }
        Err(error) => {
            inner.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
            let exhausted = attempt_number >= inner.config.max_attempts;
            let status = if exhausted {
                DeliveryStatus::Exhausted
            } else {
                DeliveryStatus::Failed
            };
            inner
                .log
                .resolve(subscription.id, delivery_id, status, Some(error.clone()));

            if exhausted {
                inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription_id = %subscription.id,
                    event_id = %event.event_id,
                    attempts = attempt_number,
                    error = %error,
                    "delivery exhausted"
                );
            } else {
                debug!(
                    subscription_id = %subscription.id,
                    event_id = %event.event_id,
                    attempt_number,
                    error = %error,
                    "delivery failed, retrying"
                );
            }
            exhausted
        }
    }
}

/// One signed HTTP POST. Success is any 2xx within the request timeout.
async fn attempt_once(
    inner: &DispatcherInner,
    subscription: &Subscription,
    event: &AnalysisEvent,
    delivery_id: Uuid,
) -> Result<(), String> {
    let envelope = DeliveryEnvelope {
        event,
        subscription_id: subscription.id,
        delivery_id,
        timestamp: Utc::now(),
    };
    let body = serde_json::to_vec(&envelope)
        .map_err(|e| format!("failed to serialize envelope: {e}"))?;
    let signature = format_signature_header(&compute_signature(
        &body,
        subscription.secret.as_bytes(),
    ));

    let response = inner
        .http
        .post(&subscription.target_url)
        .header(CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .timeout(inner.config.request_timeout)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status {}", response.status()))
    }
}
