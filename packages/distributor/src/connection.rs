//! Live push connections and their channel subscriptions.
//!
//! The registry owns all connection state. A transport (the WebSocket
//! endpoint) registers a connection, marks it open after the handshake, and
//! drains its outbound queue via [`ConnectionHandle::next_message`]. Fan-out
//! from the bus happens in [`ConnectionRegistry::run`], an event-loop task
//! that matches each event's domain against subscribed channels.
//!
//! # Backpressure
//!
//! Each connection has a bounded outbound queue. On overflow the oldest
//! queued event is dropped and a single `queue_overflow` marker takes its
//! place, telling the client to re-sync out-of-band. Connections are never
//! closed for backlog, only for transport failure.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DistributionError;
use crate::event::AnalysisEvent;

/// Default outbound queue depth per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Connection lifecycle. Channel subscriptions are accepted and events
/// delivered only while `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// A message queued for delivery to one connection.
#[derive(Debug, Clone)]
pub enum PushMessage {
    AnalysisUpdate(Arc<AnalysisEvent>),
    QueueOverflow,
}

impl PushMessage {
    /// Wire representation per the push protocol:
    /// `{"type":"analysis_update", ...event fields}` or
    /// `{"type":"queue_overflow"}`.
    pub fn to_json(&self) -> Value {
        match self {
            PushMessage::AnalysisUpdate(event) => {
                let mut obj = Map::new();
                obj.insert("type".to_string(), json!("analysis_update"));
                if let Ok(Value::Object(fields)) = serde_json::to_value(event.as_ref()) {
                    obj.extend(fields);
                }
                Value::Object(obj)
            }
            PushMessage::QueueOverflow => json!({ "type": "queue_overflow" }),
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, PushMessage::QueueOverflow)
    }
}

struct ConnectionInner {
    id: Uuid,
    state: RwLock<ConnectionState>,
    channels: RwLock<HashSet<String>>,
    queue: Mutex<VecDeque<PushMessage>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ConnectionInner {
    /// Enqueue an event, evicting the oldest entry on overflow and leaving
    /// one overflow marker at the front of the queue.
    async fn enqueue(&self, event: Arc<AnalysisEvent>) {
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                // Coalesce with an existing marker before evicting an event.
                if queue.front().map(PushMessage::is_overflow).unwrap_or(false) {
                    queue.pop_front();
                }
                if queue.pop_front().is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_front(PushMessage::QueueOverflow);
            }
            queue.push_back(PushMessage::AnalysisUpdate(event));
        }
        self.notify.notify_one();
    }
}

/// Transport-side handle to one connection's outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Events dropped from this connection's queue due to overflow.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next outbound message.
    ///
    /// Returns `None` once the connection is closed. A closing connection
    /// drains its remaining queue first.
    pub async fn next_message(&self) -> Option<PushMessage> {
        loop {
            let notified = self.inner.notify.notified();

            if let Some(msg) = self.inner.queue.lock().await.pop_front() {
                return Some(msg);
            }

            match *self.inner.state.read().await {
                ConnectionState::Closing | ConnectionState::Closed => return None,
                _ => {}
            }

            notified.await;
        }
    }
}

/// Registry of live push connections.
///
/// Cloneable; clones share state. Lifecycle is register/deregister with
/// [`ConnectionRegistry::close_all`] at process shutdown.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Uuid, Arc<ConnectionInner>>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection in the `connecting` state.
    pub fn register(&self) -> ConnectionHandle {
        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            state: RwLock::new(ConnectionState::Connecting),
            channels: RwLock::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            capacity: self.queue_capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        self.connections.insert(inner.id, inner.clone());
        debug!(connection_id = %inner.id, "connection registered");
        ConnectionHandle { inner }
    }

    fn get(&self, id: Uuid) -> Result<Arc<ConnectionInner>, DistributionError> {
        self.connections
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(DistributionError::ConnectionNotFound(id))
    }

    /// Transition `connecting → open` after the transport handshake.
    pub async fn open(&self, id: Uuid) -> Result<(), DistributionError> {
        let conn = self.get(id)?;
        let mut state = conn.state.write().await;
        match *state {
            ConnectionState::Connecting => {
                *state = ConnectionState::Open;
                debug!(connection_id = %id, "connection open");
                Ok(())
            }
            other => Err(DistributionError::ConnectionNotOpen {
                id,
                state: other.as_str(),
            }),
        }
    }

    pub async fn state(&self, id: Uuid) -> Result<ConnectionState, DistributionError> {
        let conn = self.get(id)?;
        let state = *conn.state.read().await;
        Ok(state)
    }

    /// Add channel subscriptions. Only accepted while open.
    pub async fn subscribe_channels(
        &self,
        id: Uuid,
        channels: impl IntoIterator<Item = String>,
    ) -> Result<(), DistributionError> {
        let conn = self.get(id)?;
        self.require_open(&conn).await?;
        let mut subscribed = conn.channels.write().await;
        subscribed.extend(channels);
        Ok(())
    }

    /// Remove channel subscriptions. Only accepted while open.
    pub async fn unsubscribe_channels(
        &self,
        id: Uuid,
        channels: impl IntoIterator<Item = String>,
    ) -> Result<(), DistributionError> {
        let conn = self.get(id)?;
        self.require_open(&conn).await?;
        let mut subscribed = conn.channels.write().await;
        for channel in channels {
            subscribed.remove(&channel);
        }
        Ok(())
    }

    async fn require_open(&self, conn: &ConnectionInner) -> Result<(), DistributionError> {
        let state = *conn.state.read().await;
        if state == ConnectionState::Open {
            Ok(())
        } else {
            Err(DistributionError::ConnectionNotOpen {
                id: conn.id,
                state: state.as_str(),
            })
        }
    }

    /// Transition `open → closing`. Queued messages still drain; no new
    /// events are delivered.
    pub async fn begin_close(&self, id: Uuid) -> Result<(), DistributionError> {
        let conn = self.get(id)?;
        {
            let mut state = conn.state.write().await;
            if *state == ConnectionState::Open || *state == ConnectionState::Connecting {
                *state = ConnectionState::Closing;
            }
        }
        conn.notify.notify_one();
        Ok(())
    }

    /// Remove a connection. Idempotent.
    pub async fn deregister(&self, id: Uuid) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            *conn.state.write().await = ConnectionState::Closed;
            conn.notify.notify_one();
            debug!(connection_id = %id, "connection deregistered");
        }
    }

    /// Fan an event out to every open connection whose channels match.
    ///
    /// Global events (no domain) reach all open connections.
    pub async fn dispatch(&self, event: &Arc<AnalysisEvent>) -> usize {
        // Snapshot first: holding a map shard guard across the awaits below
        // would block concurrent register/deregister calls on that shard.
        let connections: Vec<Arc<ConnectionInner>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut matched = 0;
        for conn in connections {
            if *conn.state.read().await != ConnectionState::Open {
                continue;
            }
            let interested = match &event.domain {
                None => true,
                Some(domain) => conn.channels.read().await.contains(domain),
            };
            if interested {
                conn.enqueue(event.clone()).await;
                matched += 1;
            }
        }
        matched
    }

    /// Event-loop dispatch: drain a bus receiver into connection queues.
    ///
    /// Runs until the bus side closes the channel.
    pub async fn run(self, mut rx: mpsc::Receiver<Arc<AnalysisEvent>>) {
        info!("connection fan-out started");
        while let Some(event) = rx.recv().await {
            self.dispatch(&event).await;
        }
        info!("connection fan-out stopped");
    }

    /// Close every connection. Used at process shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.connections.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "closing all connections");
        }
        for id in ids {
            self.deregister(id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
