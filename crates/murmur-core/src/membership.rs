//! Room membership and presence.
//!
//! Membership is derived: an identity is on a room's roster exactly while
//! at least one of its bound connections has joined that room. Every roster
//! change is broadcast to the room as a full snapshot.

use crate::error::ChatError;
use crate::event::Event;
use crate::identity::{validate_room_slug, ConnectionId, Identity};
use crate::registry::{ConnectionRegistry, Unbound};
use crate::room::{JoinOutcome, LeaveOutcome, RoomTable};
use crate::store::RoomCatalog;
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks which identities are present in which rooms.
pub struct MembershipManager {
    catalog: Arc<dyn RoomCatalog>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomTable>,
}

impl MembershipManager {
    /// Create a membership manager over shared state.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn RoomCatalog>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomTable>,
    ) -> Self {
        Self {
            catalog,
            registry,
            rooms,
        }
    }

    /// Fail with [`ChatError::RoomNotFound`] unless the catalog knows `room`.
    ///
    /// Slugs that could never name a room are rejected without a lookup.
    pub(crate) async fn ensure_room(
        catalog: &dyn RoomCatalog,
        room: &str,
    ) -> Result<(), ChatError> {
        if validate_room_slug(room).is_err() {
            return Err(ChatError::RoomNotFound(room.to_string()));
        }
        match catalog.room(room).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::RoomNotFound(room.to_string())),
        }
    }

    /// Join a connection to a room.
    ///
    /// The first connection of an identity puts it on the roster, which is
    /// broadcast together with a "joined" notice. Further connections of the
    /// same identity only trigger a roster broadcast. Joining twice from the
    /// same connection changes nothing.
    ///
    /// Returns the roster after the join.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] or [`ChatError::NotBound`].
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        room: &str,
    ) -> Result<Vec<Identity>, ChatError> {
        Self::ensure_room(self.catalog.as_ref(), room).await?;
        let (identity, outbox) = self.registry.handle(connection_id)?;

        let mut guard = self.rooms.lock(room).await;
        let outcome = guard.add(connection_id, &identity, outbox);

        // A disconnect may have unwound this connection while we waited for
        // the room; never leave a dead connection on the roster.
        if !self.registry.note_joined(connection_id, room) {
            guard.remove(connection_id, &identity);
            self.rooms.release(guard);
            return Err(ChatError::NotBound(connection_id.clone()));
        }

        match outcome {
            JoinOutcome::AlreadyJoined => {
                debug!(room = %room, connection = %connection_id, "Already joined");
            }
            JoinOutcome::NewConnection => {
                guard.publish_roster();
            }
            JoinOutcome::NewMember => {
                guard.publish_roster();
                guard.publish(Event::joined_notice(room, &identity));
                info!(room = %room, identity = %identity, members = guard.member_count(), "Identity joined room");
            }
        }

        let roster = guard.roster();
        self.rooms.release(guard);
        Ok(roster)
    }

    /// Remove a connection from a room.
    ///
    /// Leaving a room the connection never joined is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] or [`ChatError::NotBound`].
    pub async fn leave(&self, connection_id: &ConnectionId, room: &str) -> Result<(), ChatError> {
        Self::ensure_room(self.catalog.as_ref(), room).await?;
        let identity = self.registry.lookup(connection_id)?;
        self.registry.note_left(connection_id, room);
        self.remove_connection(connection_id, &identity, room).await;
        Ok(())
    }

    /// Drop a connection from every room it had joined.
    ///
    /// Called after the registry unbound the connection.
    pub async fn cleanup(&self, connection_id: &ConnectionId, unbound: &Unbound) {
        for room in &unbound.rooms {
            self.remove_connection(connection_id, &unbound.identity, room)
                .await;
        }
    }

    async fn remove_connection(&self, connection_id: &ConnectionId, identity: &Identity, room: &str) {
        let Some(mut guard) = self.rooms.lock_existing(room).await else {
            return;
        };

        if guard.remove(connection_id, identity) == LeaveOutcome::MemberLeft {
            guard.publish_roster();
            info!(room = %room, identity = %identity, members = guard.member_count(), "Identity left room");
        }
        self.rooms.release(guard);
    }

    /// Roster snapshot of a room, in join order.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room does not exist.
    pub async fn roster(&self, room: &str) -> Result<Vec<Identity>, ChatError> {
        Self::ensure_room(self.catalog.as_ref(), room).await?;
        Ok(self.rooms.roster(room).await)
    }
}
