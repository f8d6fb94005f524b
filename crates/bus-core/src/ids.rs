//! Identifiers and monotonic counters owned by a router instance.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bus_protocol::names::UNIQUE_NAME_PREFIX;

/// Stable identifier of an admitted connection.
///
/// Ids are never reused within one router, so a stale id can only fail to
/// resolve, never reach a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Allocates connection ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Serial numbers for messages the router sends.
///
/// Serials start at 1 and never yield 0, which is not a valid serial.
#[derive(Debug)]
pub struct SerialCounter {
    next: AtomicU32,
}

impl SerialCounter {
    /// Create a counter whose first serial is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a counter whose first serial is `first`.
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Take the next serial.
    pub fn next(&self) -> u32 {
        loop {
            let serial = self.next.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique connection names: `:1`, `:2`, ...
#[derive(Debug)]
pub struct UniqueNameCounter {
    next: AtomicU64,
}

impl UniqueNameCounter {
    /// Create a counter whose first name is `:1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next unique name.
    pub fn next(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{UNIQUE_NAME_PREFIX}{n}")
    }
}

impl Default for UniqueNameCounter {
    fn default() -> Self {
        Self::new()
    }
}
