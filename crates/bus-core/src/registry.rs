//! Name registry.
//!
//! Maps bus names (unique `:N` names and requested well-known names) to the
//! connection that owns them. At most one connection owns a name at a time.

use crate::ids::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Registry contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The name already has an owner.
    #[error("Name '{name}' is already owned by {owner}")]
    NameTaken { name: String, owner: ConnectionId },

    /// The name has no owner.
    #[error("Name '{0}' is not registered")]
    NotRegistered(String),

    /// The name is owned by someone else.
    #[error("Name '{name}' is owned by {owner}, not {caller}")]
    NotOwner {
        name: String,
        owner: ConnectionId,
        caller: ConnectionId,
    },
}

/// Name → connection registry.
#[derive(Debug, Default)]
pub struct Registry {
    /// Owner of each name.
    owners: DashMap<String, ConnectionId>,
    /// Names owned by each connection, for teardown.
    names_by_conn: DashMap<ConnectionId, HashSet<String>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NameTaken`] if any connection, including
    /// `conn` itself, already owns the name.
    pub fn register(&self, name: &str, conn: ConnectionId) -> Result<(), RegistryError> {
        match self.owners.entry(name.to_string()) {
            Entry::Occupied(entry) => Err(RegistryError::NameTaken {
                name: name.to_string(),
                owner: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(conn);
                self.names_by_conn
                    .entry(conn)
                    .or_default()
                    .insert(name.to_string());
                debug!(name = %name, connection = %conn, "Name registered");
                Ok(())
            }
        }
    }

    /// Unregister `name`, which must be owned by `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unregistered or owned by another
    /// connection. The registry is left unchanged in both cases.
    pub fn unregister(&self, name: &str, conn: ConnectionId) -> Result<(), RegistryError> {
        match self.owners.entry(name.to_string()) {
            Entry::Vacant(_) => return Err(RegistryError::NotRegistered(name.to_string())),
            Entry::Occupied(entry) if *entry.get() != conn => {
                return Err(RegistryError::NotOwner {
                    name: name.to_string(),
                    owner: *entry.get(),
                    caller: conn,
                });
            }
            Entry::Occupied(entry) => {
                entry.remove();
            }
        }

        if let Some(mut names) = self.names_by_conn.get_mut(&conn) {
            names.remove(name);
        }
        debug!(name = %name, connection = %conn, "Name unregistered");
        Ok(())
    }

    /// Look up the owner of `name`.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ConnectionId> {
        self.owners.get(name).map(|owner| *owner)
    }

    /// Remove every name owned by `conn`.
    ///
    /// Returns the removed names.
    pub fn purge(&self, conn: ConnectionId) -> Vec<String> {
        let Some((_, names)) = self.names_by_conn.remove(&conn) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            if self.owners.remove_if(&name, |_, owner| *owner == conn).is_some() {
                removed.push(name);
            }
        }

        debug!(connection = %conn, names = removed.len(), "Purged names");
        removed
    }

    /// Names currently owned by `conn`.
    #[must_use]
    pub fn names_of(&self, conn: ConnectionId) -> Vec<String> {
        self.names_by_conn
            .get(&conn)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether no name is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdAllocator;

    fn two_conns() -> (ConnectionId, ConnectionId) {
        let ids = IdAllocator::new();
        (ids.allocate(), ids.allocate())
    }

    #[test]
    fn test_register_resolve_unregister() {
        let registry = Registry::new();
        let (a, _) = two_conns();

        registry.register("com.example.Foo", a).unwrap();
        assert_eq!(registry.resolve("com.example.Foo"), Some(a));

        registry.unregister("com.example.Foo", a).unwrap();
        assert_eq!(registry.resolve("com.example.Foo"), None);
        assert!(registry.names_of(a).is_empty());
    }

    #[test]
    fn test_duplicate_register_is_rejected() {
        let registry = Registry::new();
        let (a, b) = two_conns();

        registry.register("com.example.Foo", a).unwrap();
        assert_eq!(
            registry.register("com.example.Foo", b),
            Err(RegistryError::NameTaken {
                name: "com.example.Foo".to_string(),
                owner: a
            })
        );
        // Same owner again is still a violation
        assert!(registry.register("com.example.Foo", a).is_err());
        assert_eq!(registry.resolve("com.example.Foo"), Some(a));
    }

    #[test]
    fn test_unregister_violations() {
        let registry = Registry::new();
        let (a, b) = two_conns();

        assert_eq!(
            registry.unregister("nobody.Home", a),
            Err(RegistryError::NotRegistered("nobody.Home".to_string()))
        );

        registry.register("com.example.Foo", a).unwrap();
        assert!(matches!(
            registry.unregister("com.example.Foo", b),
            Err(RegistryError::NotOwner { .. })
        ));
        assert_eq!(registry.resolve("com.example.Foo"), Some(a));
    }

    #[test]
    fn test_purge_removes_all_names_of_one_connection() {
        let registry = Registry::new();
        let (a, b) = two_conns();

        registry.register(":1", a).unwrap();
        registry.register("com.example.Foo", a).unwrap();
        registry.register("com.example.Bar", a).unwrap();
        registry.register(":2", b).unwrap();

        let mut removed = registry.purge(a);
        removed.sort();
        assert_eq!(removed, vec![":1", "com.example.Bar", "com.example.Foo"]);

        assert_eq!(registry.resolve("com.example.Foo"), None);
        assert_eq!(registry.resolve(":2"), Some(b));
        assert_eq!(registry.len(), 1);

        // Second purge is a no-op
        assert!(registry.purge(a).is_empty());
    }

    #[test]
    fn test_name_can_be_reused_after_release() {
        let registry = Registry::new();
        let (a, b) = two_conns();

        registry.register("com.example.Foo", a).unwrap();
        registry.unregister("com.example.Foo", a).unwrap();
        registry.register("com.example.Foo", b).unwrap();
        assert_eq!(registry.resolve("com.example.Foo"), Some(b));
    }
}
