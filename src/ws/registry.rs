//! Multi-dimensional index over live WebSocket connections.
//!
//! Supports point lookup by id and filtered iteration by channel, tag
//! superset, and exact attribute match — all filter dimensions are ANDed,
//! and an absent dimension imposes no constraint. Every index/reindex drains
//! the paired [`MessageQueue`] against the (re)indexed connection.
//!
//! The registry is one-per-server and constructor-injected wherever lookup
//! is needed; there are no module-level globals. Mutations never suspend
//! mid-update: map changes happen entirely under the lock, queue drain and
//! sends happen after it is released.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use tungstenite::Message;
use uuid::Uuid;

use super::connection::Connection;
use super::queue::MessageQueue;

/// Filter over a connection's indexed properties. All present dimensions
/// must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionFilter {
    /// Exact channel match.
    pub channel: Option<String>,
    /// Required tags; the connection's tag set must be a superset.
    pub tags: Vec<String>,
    /// Exact attribute matches (the identity pseudo-keys `id` and `channel`
    /// participate too).
    pub properties: HashMap<String, Value>,
}

impl ConnectionFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Whether `conn`'s current indexed state satisfies every dimension.
    #[must_use]
    pub fn matches(&self, conn: &Connection) -> bool {
        if let Some(channel) = &self.channel {
            if conn.channel() != channel {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| conn.has_tag(tag)) {
            return false;
        }
        self.properties
            .iter()
            .all(|(key, value)| conn.attr_matches(key, value))
    }
}

/// Options controlling broadcast/whisper delivery.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Queue the message when no live connection matches, to be delivered
    /// once a matching connection is indexed.
    pub queue_if_unmatched: bool,
}

impl SendOptions {
    /// Options with queuing enabled.
    #[must_use]
    pub fn queued() -> Self {
        Self {
            queue_if_unmatched: true,
        }
    }
}

/// Per-server index of live connections, paired with its message queue.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    queue: Arc<MessageQueue>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Index a connection and attempt delivery of queued messages that now
    /// match it.
    pub fn index(&self, conn: Arc<Connection>) {
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(conn.id(), conn.clone());
            debug!(connection = %conn.id(), channel = conn.channel(), total = connections.len(), "connection indexed");
        }
        self.deliver_queued(&conn);
    }

    /// Re-run queued delivery after a connection's indexed properties
    /// changed.
    pub fn reindex(&self, conn: &Arc<Connection>) {
        self.deliver_queued(conn);
    }

    /// Mutate a connection's indexed state through `f`, then reindex it.
    pub fn update<F: FnOnce(&Connection)>(&self, conn: &Arc<Connection>, f: F) {
        f(conn);
        self.reindex(conn);
    }

    fn deliver_queued(&self, conn: &Arc<Connection>) {
        // Entries are consumed regardless of the send outcome (at-most-once).
        for message in self.queue.drain_matching(conn) {
            let _ = conn.send(message);
        }
    }

    /// Remove a connection from the index.
    pub fn remove(&self, conn: &Connection) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .write()
            .ok()
            .and_then(|mut connections| connections.remove(&conn.id()));
        if removed.is_some() {
            debug!(connection = %conn.id(), "connection removed");
        }
        removed
    }

    /// Point lookup by id.
    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.read().ok()?.get(id).cloned()
    }

    /// Iterate over connections matching `filter`.
    ///
    /// The match set is snapshotted under the read lock; the returned
    /// iterator is detached from later registry mutations.
    pub fn matching(&self, filter: &ConnectionFilter) -> impl Iterator<Item = Arc<Connection>> {
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .read()
            .map(|connections| {
                connections
                    .values()
                    .filter(|conn| filter.matches(conn))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        snapshot.into_iter()
    }

    /// Send `message` to every open connection matching `filter`.
    ///
    /// Closed-but-not-yet-removed connections are silently skipped. When no
    /// live connection matches and `options.queue_if_unmatched` is set, the
    /// message is queued instead. Returns the number of connections written.
    pub fn broadcast(
        &self,
        filter: &ConnectionFilter,
        message: Message,
        options: SendOptions,
    ) -> usize {
        let live: Vec<Arc<Connection>> = self
            .matching(filter)
            .filter(|conn| conn.is_open())
            .collect();
        if live.is_empty() {
            if options.queue_if_unmatched {
                self.queue.push(filter.clone(), message, options);
            }
            return 0;
        }
        let mut sent = 0;
        for conn in live {
            if conn.send(message.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Broadcast to connections matching a bag of exact attribute values.
    pub fn broadcast_by_properties(
        &self,
        properties: HashMap<String, Value>,
        message: Message,
        options: SendOptions,
    ) -> usize {
        let filter = ConnectionFilter {
            properties,
            ..ConnectionFilter::default()
        };
        self.broadcast(&filter, message, options)
    }

    /// Send to a single connection by id.
    ///
    /// When the target is absent or closed and queuing was requested, the
    /// message is queued under an id filter.
    pub fn whisper(&self, id: &Uuid, message: Message, options: SendOptions) -> bool {
        match self.get(id) {
            Some(conn) if conn.is_open() => conn.send(message),
            _ => {
                if options.queue_if_unmatched {
                    let filter =
                        ConnectionFilter::new().property("id", Value::String(id.to_string()));
                    self.queue.push(filter, message, options);
                }
                false
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
