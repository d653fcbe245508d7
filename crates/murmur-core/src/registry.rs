//! Connection registry.
//!
//! The registry is the single source of truth for who is reachable right
//! now: it binds transport connections to identities, keeps the reverse
//! identity→connections index and remembers which rooms each connection
//! joined so disconnect can unwind them. Nothing here is ever persisted.

use crate::error::ChatError;
use crate::event::Outbox;
use crate::identity::{now_millis, ConnectionId, Identity, RoomSlug};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// A live connection binding.
#[derive(Debug)]
struct Binding {
    identity: Identity,
    bound_at: u64,
    outbox: Outbox,
    rooms: HashSet<RoomSlug>,
}

/// What an unbind left behind, for the caller to clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound {
    /// The identity the connection was bound to.
    pub identity: Identity,
    /// Rooms the connection had joined.
    pub rooms: Vec<RoomSlug>,
    /// Whether this was the identity's last live connection.
    pub last_connection: bool,
    /// When the connection was bound, in Unix milliseconds.
    pub bound_at: u64,
}

/// Connection-to-identity bindings.
///
/// The two maps are never locked at the same time, so lookups from either
/// side cannot deadlock against a concurrent bind.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Binding>,
    identities: DashMap<Identity, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to an identity.
    ///
    /// Re-binding to the same identity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::AlreadyBound`] if the connection is bound to a
    /// different identity.
    pub fn bind(
        &self,
        connection_id: &ConnectionId,
        identity: &Identity,
        outbox: Outbox,
    ) -> Result<(), ChatError> {
        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(entry) => {
                let bound = &entry.get().identity;
                if bound == identity {
                    return Ok(());
                }
                return Err(ChatError::AlreadyBound {
                    connection: connection_id.clone(),
                    identity: bound.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Binding {
                    identity: identity.clone(),
                    bound_at: now_millis(),
                    outbox,
                    rooms: HashSet::new(),
                });
            }
        }

        self.identities
            .entry(identity.clone())
            .or_default()
            .insert(connection_id.clone());

        debug!(connection = %connection_id, identity = %identity, "Connection bound");
        Ok(())
    }

    /// Remove a binding.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] if the connection is unknown. Callers
    /// on the disconnect path treat that as a no-op.
    pub fn unbind(&self, connection_id: &ConnectionId) -> Result<Unbound, ChatError> {
        let (_, binding) = self
            .connections
            .remove(connection_id)
            .ok_or_else(|| ChatError::NotBound(connection_id.clone()))?;

        let last_connection = match self.identities.entry(binding.identity.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(connection_id);
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };

        debug!(
            connection = %connection_id,
            identity = %binding.identity,
            rooms = binding.rooms.len(),
            last_connection,
            "Connection unbound"
        );

        Ok(Unbound {
            identity: binding.identity,
            rooms: binding.rooms.into_iter().collect(),
            last_connection,
            bound_at: binding.bound_at,
        })
    }

    /// The identity bound to a connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] if the connection is unknown.
    pub fn lookup(&self, connection_id: &ConnectionId) -> Result<Identity, ChatError> {
        self.connections
            .get(connection_id)
            .map(|b| b.identity.clone())
            .ok_or_else(|| ChatError::NotBound(connection_id.clone()))
    }

    /// The identity and outbox of a connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] if the connection is unknown.
    pub fn handle(&self, connection_id: &ConnectionId) -> Result<(Identity, Outbox), ChatError> {
        self.connections
            .get(connection_id)
            .map(|b| (b.identity.clone(), b.outbox.clone()))
            .ok_or_else(|| ChatError::NotBound(connection_id.clone()))
    }

    /// Record that a connection joined a room.
    ///
    /// Returns `false` if the connection is no longer bound, in which case
    /// the caller must undo the join.
    pub fn note_joined(&self, connection_id: &ConnectionId, room: &str) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut binding) => {
                binding.rooms.insert(room.to_string());
                true
            }
            None => false,
        }
    }

    /// Record that a connection left a room.
    pub fn note_left(&self, connection_id: &ConnectionId, room: &str) {
        if let Some(mut binding) = self.connections.get_mut(connection_id) {
            binding.rooms.remove(room);
        }
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomSlug> {
        self.connections
            .get(connection_id)
            .map(|b| b.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live connections of an identity.
    #[must_use]
    pub fn connections_of(&self, identity: &Identity) -> Vec<ConnectionId> {
        self.identities
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Outboxes of every live connection of an identity.
    #[must_use]
    pub fn outboxes_of(&self, identity: &Identity) -> Vec<Outbox> {
        // Collect ids first so the identity shard is released before the
        // connection shards are read.
        self.connections_of(identity)
            .iter()
            .filter_map(|id| self.connections.get(id).map(|b| b.outbox.clone()))
            .collect()
    }

    /// Whether an identity has at least one live connection.
    #[must_use]
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.identities.contains_key(identity)
    }

    /// Number of bound connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct identities online.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::outbox;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();
        let alice = Identity::from("alice");

        registry.bind(&conn("c1"), &alice, tx).unwrap();
        assert_eq!(registry.lookup(&conn("c1")).unwrap(), alice);
        assert!(registry.is_online(&alice));

        let unbound = registry.unbind(&conn("c1")).unwrap();
        assert_eq!(unbound.identity, alice);
        assert!(unbound.last_connection);
        assert!(unbound.bound_at > 0);
        assert!(matches!(
            registry.lookup(&conn("c1")),
            Err(ChatError::NotBound(_))
        ));
        assert!(!registry.is_online(&alice));
    }

    #[test]
    fn test_rebind_same_identity_is_noop() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();
        let alice = Identity::from("alice");

        registry.bind(&conn("c1"), &alice, tx.clone()).unwrap();
        registry.bind(&conn("c1"), &alice, tx).unwrap();
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connections_of(&alice).len(), 1);
    }

    #[test]
    fn test_bind_different_identity_fails() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();

        registry.bind(&conn("c1"), &"alice".into(), tx.clone()).unwrap();
        let err = registry.bind(&conn("c1"), &"bob".into(), tx).unwrap_err();
        assert!(matches!(err, ChatError::AlreadyBound { ref identity, .. } if identity.as_str() == "alice"));
        assert_eq!(registry.lookup(&conn("c1")).unwrap().as_str(), "alice");
    }

    #[test]
    fn test_unbind_unknown_connection() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.unbind(&conn("ghost")),
            Err(ChatError::NotBound(_))
        ));
    }

    #[test]
    fn test_unbind_returns_joined_rooms() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();

        registry.bind(&conn("c1"), &"alice".into(), tx).unwrap();
        assert!(registry.note_joined(&conn("c1"), "public"));
        assert!(registry.note_joined(&conn("c1"), "boys"));
        registry.note_left(&conn("c1"), "boys");

        let unbound = registry.unbind(&conn("c1")).unwrap();
        assert_eq!(unbound.rooms, vec!["public".to_string()]);
        assert!(!registry.note_joined(&conn("c1"), "public"));
    }

    #[test]
    fn test_multiple_connections_per_identity() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let alice = Identity::from("alice");

        registry.bind(&conn("c1"), &alice, tx1).unwrap();
        registry.bind(&conn("c2"), &alice, tx2).unwrap();
        assert_eq!(registry.outboxes_of(&alice).len(), 2);
        assert_eq!(registry.identity_count(), 1);

        assert!(!registry.unbind(&conn("c1")).unwrap().last_connection);
        assert!(registry.is_online(&alice));
        assert!(registry.unbind(&conn("c2")).unwrap().last_connection);
    }
}
