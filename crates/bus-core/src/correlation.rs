//! Reply correlation table.
//!
//! When the router forwards a directed message it stamps it with a fresh serial
//! and remembers who asked. The first reply carrying that serial goes back
//! to the origin. Entries have no expiry: one whose destination never
//! answers stays until the origin connection closes.

use crate::ids::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// A reply the router is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReply {
    /// Connection that sent the original call.
    pub origin: ConnectionId,
    /// Serial the origin gave the call, restored on the reply.
    pub origin_serial: u32,
}

/// Forwarded serial → pending reply.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<u32, PendingReply>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a reply to `serial` belongs to `origin`.
    ///
    /// Returns `false` and leaves the table untouched if `serial` is still
    /// pending, which can happen once the serial counter wraps.
    pub fn insert(&self, serial: u32, origin: ConnectionId, origin_serial: u32) -> bool {
        match self.pending.entry(serial) {
            Entry::Occupied(existing) => {
                debug!(serial, pending = %existing.get().origin, "Serial still pending");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingReply {
                    origin,
                    origin_serial,
                });
                debug!(serial, origin = %origin, "Expecting reply");
                true
            }
        }
    }

    /// Remove and return the entry for `serial`.
    pub fn take(&self, serial: u32) -> Option<PendingReply> {
        self.pending.remove(&serial).map(|(_, entry)| entry)
    }

    /// Look at the entry for `serial` without consuming it.
    #[must_use]
    pub fn get(&self, serial: u32) -> Option<PendingReply> {
        self.pending.get(&serial).map(|entry| *entry)
    }

    /// Drop every entry whose origin is `conn`.
    ///
    /// Returns the number of entries removed.
    pub fn purge(&self, conn: ConnectionId) -> usize {
        let mut removed = 0;
        self.pending.retain(|_, entry| {
            let keep = entry.origin != conn;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(connection = %conn, removed, "Purged pending replies");
        }
        removed
    }

    /// Number of replies `conn` is waiting for.
    #[must_use]
    pub fn pending_for(&self, conn: ConnectionId) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.origin == conn)
            .count()
    }

    /// Total number of pending replies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
