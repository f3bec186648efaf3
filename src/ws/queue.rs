//! Queue of undeliverable messages awaiting a matching connection.
//!
//! Entries hold a filter, a payload, and the original send options — never a
//! live connection reference. An entry is consumed at most once: the drain
//! removes it before attempting the send, so a failed delivery is not
//! retried. Entries do not expire on their own.

use std::sync::Mutex;

use tracing::debug;
use tungstenite::Message;

use super::connection::Connection;
use super::registry::{ConnectionFilter, SendOptions};

struct QueuedEntry {
    filter: ConnectionFilter,
    message: Message,
    #[allow(dead_code)]
    options: SendOptions,
}

/// Holds `(filter, message, options)` tuples until a matching connection is
/// indexed or reindexed.
#[derive(Default)]
pub struct MessageQueue {
    entries: Mutex<Vec<QueuedEntry>>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message for later delivery.
    pub fn push(&self, filter: ConnectionFilter, message: Message, options: SendOptions) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(QueuedEntry {
                filter,
                message,
                options,
            });
            debug!(queued = entries.len(), "message queued for later delivery");
        }
    }

    /// Remove and return the payload of every entry whose filter matches
    /// `conn`'s current properties.
    ///
    /// Removal happens here, regardless of what the caller's send attempt
    /// does with the payload — delivery is at-most-once per entry.
    #[must_use]
    pub fn drain_matching(&self, conn: &Connection) -> Vec<Message> {
        let Ok(mut entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut delivered = Vec::new();
        entries.retain(|entry| {
            if entry.filter.matches(conn) {
                delivered.push(entry.message.clone());
                false
            } else {
                true
            }
        });
        if !delivered.is_empty() {
            debug!(
                connection = %conn.id(),
                delivered = delivered.len(),
                "queued messages drained"
            );
        }
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
