//! Room state and the per-room single-writer table.
//!
//! A room holds its roster (identities in join order) and the outbox handles
//! of every joined connection. All mutation goes through the room's own
//! async mutex, so joins, leaves and message fan-out for one room are
//! serialized while different rooms proceed independently.

use crate::event::{deliver, Event, Outbox};
use crate::identity::{ConnectionId, Identity, RoomSlug};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// Result of adding a connection to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was already in the room.
    AlreadyJoined,
    /// The identity was present; this is an extra connection.
    NewConnection,
    /// First connection of the identity; it is now on the roster.
    NewMember,
}

/// Result of removing a connection from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was not in the room.
    NotJoined,
    /// The identity still has other connections in the room.
    ConnectionRemoved,
    /// That was the identity's last connection; it left the roster.
    MemberLeft,
}

/// State of one room.
#[derive(Debug)]
pub struct Room {
    slug: RoomSlug,
    /// Roster in join order.
    order: Vec<Identity>,
    /// Live connection handles per member.
    members: HashMap<Identity, HashMap<ConnectionId, Outbox>>,
    /// Set once the room has been dropped from the table.
    retired: bool,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(slug: impl Into<RoomSlug>) -> Self {
        Self {
            slug: slug.into(),
            order: Vec::new(),
            members: HashMap::new(),
            retired: false,
        }
    }

    /// Get the room slug.
    #[must_use]
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Roster snapshot in join order.
    #[must_use]
    pub fn roster(&self) -> Vec<Identity> {
        self.order.clone()
    }

    /// Check if an identity is on the roster.
    #[must_use]
    pub fn is_member(&self, identity: &Identity) -> bool {
        self.members.contains_key(identity)
    }

    /// Number of identities on the roster.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.order.len()
    }

    /// Number of joined connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.members.values().map(HashMap::len).sum()
    }

    /// Check if the room has no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a connection for an identity.
    pub fn add(
        &mut self,
        connection_id: &ConnectionId,
        identity: &Identity,
        outbox: Outbox,
    ) -> JoinOutcome {
        let handles = match self.members.get_mut(identity) {
            Some(handles) => handles,
            None => {
                self.order.push(identity.clone());
                let mut handles = HashMap::new();
                handles.insert(connection_id.clone(), outbox);
                self.members.insert(identity.clone(), handles);
                debug!(room = %self.slug, identity = %identity, "Member joined");
                return JoinOutcome::NewMember;
            }
        };

        if handles.contains_key(connection_id) {
            return JoinOutcome::AlreadyJoined;
        }
        handles.insert(connection_id.clone(), outbox);
        trace!(room = %self.slug, identity = %identity, connection = %connection_id, "Extra connection joined");
        JoinOutcome::NewConnection
    }

    /// Remove a connection of an identity.
    pub fn remove(&mut self, connection_id: &ConnectionId, identity: &Identity) -> LeaveOutcome {
        let Some(handles) = self.members.get_mut(identity) else {
            return LeaveOutcome::NotJoined;
        };
        if handles.remove(connection_id).is_none() {
            return LeaveOutcome::NotJoined;
        }
        if !handles.is_empty() {
            return LeaveOutcome::ConnectionRemoved;
        }

        self.members.remove(identity);
        self.order.retain(|m| m != identity);
        debug!(room = %self.slug, identity = %identity, "Member left");
        LeaveOutcome::MemberLeft
    }

    /// Deliver an event to every joined connection.
    ///
    /// Returns the number of connections that received it.
    pub fn publish(&self, event: Event) -> usize {
        deliver(event, self.members.values().flat_map(HashMap::values))
    }

    /// Deliver an event to every joined connection not owned by `identity`.
    pub fn publish_except(&self, event: Event, identity: &Identity) -> usize {
        deliver(
            event,
            self.members
                .iter()
                .filter(|(member, _)| *member != identity)
                .flat_map(|(_, handles)| handles.values()),
        )
    }

    /// Broadcast the current roster.
    pub fn publish_roster(&self) -> usize {
        self.publish(Event::Roster {
            room: self.slug.clone(),
            members: self.roster(),
        })
    }
}

/// Exclusive access to one room.
pub type RoomGuard = OwnedMutexGuard<Room>;

/// Table of live rooms, one async mutex per slug.
#[derive(Debug)]
pub struct RoomTable {
    rooms: DashMap<RoomSlug, Arc<Mutex<Room>>>,
    retire_empty: bool,
}

impl RoomTable {
    /// Create a table.
    ///
    /// With `retire_empty`, rooms left without connections are dropped and
    /// recreated on next use.
    #[must_use]
    pub fn new(retire_empty: bool) -> Self {
        Self {
            rooms: DashMap::new(),
            retire_empty,
        }
    }

    /// Lock a room, creating its state if needed.
    pub async fn lock(&self, slug: &str) -> RoomGuard {
        loop {
            let cell = self
                .rooms
                .entry(slug.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Room::new(slug))))
                .clone();
            let guard = cell.lock_owned().await;
            if !guard.retired {
                return guard;
            }
            // Lost a race with retirement; the table holds a fresh cell now.
        }
    }

    /// Lock a room only if it has live state.
    pub async fn lock_existing(&self, slug: &str) -> Option<RoomGuard> {
        loop {
            let cell = self.rooms.get(slug)?.clone();
            let guard = cell.lock_owned().await;
            if !guard.retired {
                return Some(guard);
            }
        }
    }

    /// Release a room, retiring it if it is empty.
    pub fn release(&self, mut guard: RoomGuard) {
        if !self.retire_empty || !guard.is_empty() {
            return;
        }
        guard.retired = true;
        let slug = guard.slug.clone();
        let mine = OwnedMutexGuard::mutex(&guard);
        self.rooms.remove_if(&slug, |_, cell| Arc::ptr_eq(cell, mine));
        debug!(room = %slug, "Retired empty room");
    }

    /// Roster snapshot, empty if the room has no live state.
    pub async fn roster(&self, slug: &str) -> Vec<Identity> {
        match self.lock_existing(slug).await {
            Some(guard) => guard.roster(),
            None => Vec::new(),
        }
    }

    /// Number of rooms with live state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.rooms.len()
    }

    /// Slugs of rooms with live state.
    #[must_use]
    pub fn active_slugs(&self) -> Vec<RoomSlug> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::outbox;

    #[test]
    fn test_room_creation() {
        let room = Room::new("public");
        assert_eq!(room.slug(), "public");
        assert_eq!(room.member_count(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_roster_keeps_join_order_and_dedups() {
        let mut room = Room::new("public");
        let (tx, _rx) = outbox();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));

        assert_eq!(room.add(&"c1".into(), &bob, tx.clone()), JoinOutcome::NewMember);
        assert_eq!(room.add(&"c2".into(), &alice, tx.clone()), JoinOutcome::NewMember);
        assert_eq!(room.add(&"c3".into(), &bob, tx.clone()), JoinOutcome::NewConnection);
        assert_eq!(room.add(&"c3".into(), &bob, tx), JoinOutcome::AlreadyJoined);

        assert_eq!(room.roster(), vec![bob, alice]);
        assert_eq!(room.connection_count(), 3);
    }

    #[test]
    fn test_member_leaves_with_last_connection() {
        let mut room = Room::new("public");
        let (tx, _rx) = outbox();
        let alice = Identity::from("alice");

        room.add(&"c1".into(), &alice, tx.clone());
        room.add(&"c2".into(), &alice, tx);

        assert_eq!(room.remove(&"c1".into(), &alice), LeaveOutcome::ConnectionRemoved);
        assert!(room.is_member(&alice));
        assert_eq!(room.remove(&"c2".into(), &alice), LeaveOutcome::MemberLeft);
        assert!(!room.is_member(&alice));
        assert_eq!(room.remove(&"c2".into(), &alice), LeaveOutcome::NotJoined);
        assert!(room.is_empty());
    }

    #[test]
    fn test_publish_except_skips_identity() {
        let mut room = Room::new("public");
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        let (alice, bob) = (Identity::from("alice"), Identity::from("bob"));

        room.add(&"c1".into(), &alice, tx_a);
        room.add(&"c2".into(), &bob, tx_b);

        let event = Event::Typing {
            room: "public".into(),
            identity: alice.clone(),
        };
        assert_eq!(room.publish_except(event, &alice), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());

        assert_eq!(room.publish_roster(), 2);
    }

    #[tokio::test]
    async fn test_table_retires_empty_rooms() {
        let table = RoomTable::new(true);
        let (tx, _rx) = outbox();
        let alice = Identity::from("alice");

        let mut guard = table.lock("public").await;
        guard.add(&"c1".into(), &alice, tx);
        table.release(guard);
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.roster("public").await, vec![alice.clone()]);

        let mut guard = table.lock("public").await;
        guard.remove(&"c1".into(), &alice);
        table.release(guard);
        assert_eq!(table.active_count(), 0);
        assert!(table.lock_existing("public").await.is_none());

        // Recreated transparently.
        let guard = table.lock("public").await;
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn test_table_keeps_empty_rooms_when_configured() {
        let table = RoomTable::new(false);
        let guard = table.lock("public").await;
        table.release(guard);
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.active_slugs(), vec!["public".to_string()]);
    }
}
