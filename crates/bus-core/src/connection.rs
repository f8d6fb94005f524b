//! The set of admitted connections.
//!
//! Each record holds the connection's unique name and the sending half of
//! its outbound queue. The transport task that owns the socket holds the
//! receiving half and writes whatever arrives; routing never blocks on I/O.

use crate::ids::{ConnectionId, IdAllocator};
use bus_protocol::Message;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Message>;

#[derive(Debug)]
struct ConnectionEntry {
    unique_name: String,
    outbound: Outbound,
    closed: AtomicBool,
}

/// Arena of admitted connections addressed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    ids: IdAllocator,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id for a connection about to be admitted.
    pub fn allocate_id(&self) -> ConnectionId {
        self.ids.allocate()
    }

    /// Add a connection to the active set.
    pub fn insert(&self, id: ConnectionId, unique_name: impl Into<String>, outbound: Outbound) {
        self.entries.insert(
            id,
            ConnectionEntry {
                unique_name: unique_name.into(),
                outbound,
                closed: AtomicBool::new(false),
            },
        );
    }

    /// Get the unique name of a live connection.
    #[must_use]
    pub fn unique_name(&self, id: ConnectionId) -> Option<String> {
        self.entries
            .get(&id)
            .filter(|e| !e.closed.load(Ordering::Acquire))
            .map(|e| e.unique_name.clone())
    }

    /// Whether `id` is admitted and not closing.
    #[must_use]
    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| !e.closed.load(Ordering::Acquire))
    }

    /// Queue a message for a connection.
    ///
    /// Returns `false` if the connection is gone, closing, or its writer
    /// has already stopped.
    pub fn deliver(&self, id: ConnectionId, message: Message) -> bool {
        let Some(outbound) = self.outbound(id) else {
            return false;
        };
        outbound.send(message).is_ok()
    }

    /// Snapshot the outbound queues of every live connection.
    #[must_use]
    pub fn active(&self) -> Vec<(ConnectionId, Outbound)> {
        self.entries
            .iter()
            .filter(|e| !e.closed.load(Ordering::Acquire))
            .map(|e| (*e.key(), e.outbound.clone()))
            .collect()
    }

    /// Mark a connection as closing.
    ///
    /// Returns `true` for exactly one caller per connection; every later
    /// call (or a call for an unknown id) returns `false`.
    pub fn begin_close(&self, id: ConnectionId) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| !e.closed.swap(true, Ordering::AcqRel))
    }

    /// Remove a connection from the active set.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Number of admitted connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn outbound(&self, id: ConnectionId) -> Option<Outbound> {
        self.entries
            .get(&id)
            .filter(|e| !e.closed.load(Ordering::Acquire))
            .map(|e| e.outbound.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_and_close() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert(id, ":1", tx);

        assert!(table.deliver(id, Message::signal("/", "a.b", "C")));
        assert!(rx.try_recv().is_ok());
        assert_eq!(table.unique_name(id).as_deref(), Some(":1"));

        assert!(table.begin_close(id));
        assert!(!table.begin_close(id));

        // Closing connections no longer receive anything
        assert!(!table.deliver(id, Message::signal("/", "a.b", "C")));
        assert!(table.active().is_empty());

        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert!(!table.begin_close(id));
    }

    #[test]
    fn test_deliver_to_dropped_receiver() {
        let table = ConnectionTable::new();
        let id = table.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(id, ":1", tx);
        drop(rx);

        assert!(!table.deliver(id, Message::signal("/", "a.b", "C")));
    }
}
