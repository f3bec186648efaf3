//! A live WebSocket client connection.
//!
//! Identity (id, channel, origin) is fixed at upgrade completion: the id is a
//! server-assigned UUID, the channel comes from the upgrade path, the origin
//! from the handshake. Mutable state is split into the *indexed* bag (tags
//! and attributes the registry filters on) and the free-form *properties*
//! bag (not indexed).
//!
//! Writes go through a [`MessageSink`]; writing to a dead socket is a
//! swallowed no-op, never a crash — closing the peer is the only
//! cancellation signal this runtime has.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use may::net::TcpStream;
// Coroutine-aware lock: the reader parks inside read() while holding it, and
// a std mutex would pin the scheduler thread for that whole window.
use may::sync::Mutex;
use serde_json::Value;
use tracing::debug;
use tungstenite::{Message, WebSocket};
use uuid::Uuid;

/// Outbound half of a connection's socket.
///
/// The trait seam keeps the registry and queue testable without real
/// sockets; the production implementation is [`WsSocket`].
pub trait MessageSink: Send + Sync {
    /// Send one message. Returns `false` (without erroring) when the socket
    /// is no longer writable.
    fn send(&self, msg: Message) -> bool;

    /// Initiate a close handshake; errors are swallowed.
    fn close(&self);
}

/// `tungstenite`-backed socket shared between the reader loop and senders.
///
/// All frame I/O is serialized through one mutex; the reader keeps the lock
/// only for the duration of a single (read-timeout-bounded) read call, so
/// heartbeat and broadcast writers are never starved.
pub struct WsSocket {
    inner: Mutex<WebSocket<TcpStream>>,
}

impl WsSocket {
    #[must_use]
    pub fn new(ws: WebSocket<TcpStream>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ws),
        })
    }

    /// Read the next frame. Io `WouldBlock`/`TimedOut` errors are idle ticks,
    /// not failures.
    pub fn read(&self) -> Result<Message, tungstenite::Error> {
        match self.inner.lock() {
            Ok(mut ws) => ws.read(),
            Err(_) => Err(tungstenite::Error::AlreadyClosed),
        }
    }
}

impl MessageSink for WsSocket {
    fn send(&self, msg: Message) -> bool {
        match self.inner.lock() {
            Ok(mut ws) => ws.send(msg).is_ok(),
            Err(_) => false,
        }
    }

    fn close(&self) {
        if let Ok(mut ws) = self.inner.lock() {
            let _ = ws.close(None);
            let _ = ws.flush();
        }
    }
}

/// Tags and attributes tracked by the registry for filtered lookup.
#[derive(Debug, Clone, Default)]
pub struct IndexedProperties {
    pub tags: HashSet<String>,
    pub attrs: HashMap<String, Value>,
}

/// A registered WebSocket connection.
pub struct Connection {
    id: Uuid,
    channel: String,
    origin: Option<String>,
    peer_addr: Option<SocketAddr>,
    indexed: RwLock<IndexedProperties>,
    properties: RwLock<HashMap<String, Value>>,
    sink: Arc<dyn MessageSink>,
    open: AtomicBool,
}

impl Connection {
    /// Create a connection at upgrade completion with a fresh server-assigned
    /// id.
    #[must_use]
    pub fn new(
        sink: Arc<dyn MessageSink>,
        channel: impl Into<String>,
        origin: Option<String>,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            origin,
            peer_addr,
            indexed: RwLock::new(IndexedProperties::default()),
            properties: RwLock::new(HashMap::new()),
            sink,
            open: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a message if the socket is still open. A failed or closed send
    /// marks the connection closed and reports `false`; it never errors.
    pub fn send(&self, msg: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        let ok = self.sink.send(msg);
        if !ok {
            debug!(connection = %self.id, "send on dead socket ignored");
            self.mark_closed();
        }
        ok
    }

    /// Close the socket and mark the connection dead.
    pub fn close(&self) {
        self.sink.close();
        self.mark_closed();
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Snapshot of the indexed tag set.
    #[must_use]
    pub fn tags(&self) -> HashSet<String> {
        self.indexed
            .read()
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.indexed
            .read()
            .map(|i| i.tags.contains(tag))
            .unwrap_or(false)
    }

    /// Mutate the indexed bag. Callers must reindex through the registry
    /// afterwards so queued messages get a delivery attempt.
    pub fn add_tag(&self, tag: impl Into<String>) {
        if let Ok(mut indexed) = self.indexed.write() {
            indexed.tags.insert(tag.into());
        }
    }

    pub fn remove_tag(&self, tag: &str) {
        if let Ok(mut indexed) = self.indexed.write() {
            indexed.tags.remove(tag);
        }
    }

    #[must_use]
    pub fn attr(&self, key: &str) -> Option<Value> {
        self.indexed.read().ok()?.attrs.get(key).cloned()
    }

    /// Set an indexed attribute. Callers must reindex through the registry
    /// afterwards.
    pub fn set_attr(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut indexed) = self.indexed.write() {
            indexed.attrs.insert(key.into(), value);
        }
    }

    /// Unindexed free-form property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.read().ok()?.get(key).cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut properties) = self.properties.write() {
            properties.insert(key.into(), value);
        }
    }

    /// Whether an indexed attribute (or the identity pseudo-keys `id` and
    /// `channel`) equals `value`.
    #[must_use]
    pub fn attr_matches(&self, key: &str, value: &Value) -> bool {
        match key {
            "id" => value.as_str() == Some(self.id.to_string().as_str()),
            "channel" => value.as_str() == Some(self.channel.as_str()),
            _ => self.attr(key).as_ref() == Some(value),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("origin", &self.origin)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_is_fixed_and_unique() {
        let a = Connection::new(Arc::new(RecordingSink::default()), "chat", None, None);
        let b = Connection::new(Arc::new(RecordingSink::default()), "chat", None, None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.channel(), "chat");
    }

    #[test]
    fn test_send_after_close_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let conn = Connection::new(sink.clone(), "chat", None, None);
        conn.mark_closed();
        assert!(!conn.send(Message::text("dropped")));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_send_marks_closed() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let conn = Connection::new(sink, "chat", None, None);
        assert!(!conn.send(Message::text("x")));
        assert!(!conn.is_open());
    }

    #[test]
    fn test_attr_matches_identity_keys() {
        let conn = Connection::new(Arc::new(RecordingSink::default()), "chat", None, None);
        conn.set_attr("role", json!("admin"));
        assert!(conn.attr_matches("role", &json!("admin")));
        assert!(conn.attr_matches("channel", &json!("chat")));
        assert!(conn.attr_matches("id", &json!(conn.id().to_string())));
        assert!(!conn.attr_matches("role", &json!("guest")));
    }
}
