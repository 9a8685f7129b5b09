//! In-process fan-out bus for analysis events.
//!
//! # Guarantees
//!
//! - **Non-blocking publish**: a slow consumer never blocks the producer or
//!   its sibling consumers.
//! - **Per-consumer ordering**: each consumer observes events in publish
//!   order over its own queue.
//! - **At-most-once delivery**: when a consumer's queue is full the event is
//!   dropped for that consumer only and its dropped counter is incremented.
//! - **In-memory only**: no persistence, no replay.
//!
//! Consumers that need durability (the webhook subsystem) record their own
//! terminal state; the bus itself owns none.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::AnalysisEvent;

/// Default intake queue depth for a consumer.
pub const DEFAULT_CONSUMER_CAPACITY: usize = 1024;

struct Consumer {
    name: String,
    tx: mpsc::Sender<Arc<AnalysisEvent>>,
    dropped: Arc<AtomicU64>,
}

/// Identifies a registered consumer. Pass back to [`EventBus::unsubscribe`]
/// to deregister; exposes that consumer's dropped-event counter.
#[derive(Clone)]
pub struct ConsumerHandle {
    id: u64,
    name: String,
    dropped: Arc<AtomicU64>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events dropped for this consumer because its queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-consumer counters for diagnostics.
#[derive(Debug, Clone)]
pub struct BusConsumerStats {
    pub name: String,
    pub dropped_events: u64,
}

/// In-process publish/subscribe core.
///
/// Cloneable; clones share the same consumer registry. Events are shared
/// between consumers as `Arc<AnalysisEvent>`, so fan-out never copies the
/// payload.
#[derive(Clone)]
pub struct EventBus {
    consumers: Arc<DashMap<u64, Consumer>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            consumers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish an event to every registered consumer.
    ///
    /// Never blocks and never fails. Returns the number of consumers whose
    /// queue accepted the event.
    pub fn publish(&self, event: AnalysisEvent) -> usize {
        self.publish_arc(Arc::new(event))
    }

    /// Publish an already-shared event.
    pub fn publish_arc(&self, event: Arc<AnalysisEvent>) -> usize {
        let mut delivered = 0;
        let mut disconnected = Vec::new();

        for entry in self.consumers.iter() {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        consumer = %entry.name,
                        event_id = %event.event_id,
                        "consumer queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    disconnected.push(*entry.key());
                }
            }
        }

        // Consumers whose receiver was dropped are pruned lazily.
        for id in disconnected {
            if let Some((_, consumer)) = self.consumers.remove(&id) {
                debug!(consumer = %consumer.name, "removing disconnected consumer");
            }
        }

        delivered
    }

    /// Register a consumer with a bounded intake queue.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        capacity: usize,
    ) -> (ConsumerHandle, mpsc::Receiver<Arc<AnalysisEvent>>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.consumers.insert(
            id,
            Consumer {
                name: name.clone(),
                tx,
                dropped: dropped.clone(),
            },
        );

        debug!(consumer = %name, capacity, "consumer subscribed");
        (ConsumerHandle { id, name, dropped }, rx)
    }

    /// Deregister a consumer. Events already queued remain readable.
    pub fn unsubscribe(&self, handle: &ConsumerHandle) {
        if self.consumers.remove(&handle.id).is_some() {
            debug!(consumer = %handle.name, "consumer unsubscribed");
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn stats(&self) -> Vec<BusConsumerStats> {
        self.consumers
            .iter()
            .map(|entry| BusConsumerStats {
                name: entry.name.clone(),
                dropped_events: entry.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("consumer_count", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn event(n: i64) -> AnalysisEvent {
        AnalysisEvent::new(EventType::MetricChange, None, json!({ "n": n }))
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_consumer() {
        let bus = EventBus::new();
        let (_handle, mut rx) = bus.subscribe("test", 16);

        for n in 0..5 {
            bus.publish(event(n));
        }

        for n in 0..5 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn each_consumer_gets_every_event() {
        let bus = EventBus::new();
        let (_h1, mut rx1) = bus.subscribe("a", 16);
        let (_h2, mut rx2) = bus.subscribe("b", 16);

        let delivered = bus.publish(event(7));
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().payload["n"], 7);
        assert_eq!(rx2.recv().await.unwrap().payload["n"], 7);
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_consumer_only() {
        let bus = EventBus::new();
        let (slow, mut slow_rx) = bus.subscribe("slow", 1);
        let (fast, mut fast_rx) = bus.subscribe("fast", 16);

        bus.publish(event(1));
        bus.publish(event(2));
        bus.publish(event(3));

        // Slow consumer kept only the first event and dropped two.
        assert_eq!(slow.dropped_events(), 2);
        assert_eq!(slow_rx.recv().await.unwrap().payload["n"], 1);

        // Fast consumer saw everything.
        assert_eq!(fast.dropped_events(), 0);
        for n in 1..=3 {
            assert_eq!(fast_rx.recv().await.unwrap().payload["n"], n);
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (handle, mut rx) = bus.subscribe("test", 16);

        bus.publish(event(1));
        bus.unsubscribe(&handle);
        let delivered = bus.publish(event(2));

        assert_eq!(delivered, 0);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let (_handle, rx) = bus.subscribe("gone", 16);
        drop(rx);

        bus.publish(event(1));
        assert_eq!(bus.consumer_count(), 0);
    }

    #[tokio::test]
    async fn publish_with_no_consumers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(event(1)), 0);
    }

    #[tokio::test]
    async fn stats_reports_per_consumer_drops() {
        let bus = EventBus::new();
        let (_slow, _slow_rx) = bus.subscribe("slow", 1);

        bus.publish(event(1));
        bus.publish(event(2));

        let stats = bus.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "slow");
        assert_eq!(stats[0].dropped_events, 1);
    }
}
