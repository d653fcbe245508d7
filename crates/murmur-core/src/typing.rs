//! Typing indicators.
//!
//! Typing signals are relayed to the other members of a room and then
//! forgotten. The server keeps no timer: clients clear an indicator on an
//! explicit stop or after their own timeout without renewal.

use crate::error::ChatError;
use crate::event::Event;
use crate::identity::Identity;
use crate::membership::MembershipManager;
use crate::room::RoomTable;
use crate::store::RoomCatalog;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Client-side display timeout advertised to clients.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Stateless relay of typing signals.
pub struct TypingBroadcaster {
    catalog: Arc<dyn RoomCatalog>,
    rooms: Arc<RoomTable>,
}

impl TypingBroadcaster {
    /// Create a broadcaster over shared room state.
    #[must_use]
    pub fn new(catalog: Arc<dyn RoomCatalog>, rooms: Arc<RoomTable>) -> Self {
        Self { catalog, rooms }
    }

    /// Tell the other members of `room` that `identity` is typing.
    ///
    /// Returns the number of connections notified.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room does not exist.
    pub async fn notify_typing(&self, room: &str, identity: &Identity) -> Result<usize, ChatError> {
        self.relay(
            room,
            identity,
            Event::Typing {
                room: room.to_string(),
                identity: identity.clone(),
            },
        )
        .await
    }

    /// Tell the other members of `room` that `identity` stopped typing.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room does not exist.
    pub async fn notify_stop_typing(
        &self,
        room: &str,
        identity: &Identity,
    ) -> Result<usize, ChatError> {
        self.relay(
            room,
            identity,
            Event::StopTyping {
                room: room.to_string(),
                identity: identity.clone(),
            },
        )
        .await
    }

    async fn relay(&self, room: &str, identity: &Identity, event: Event) -> Result<usize, ChatError> {
        MembershipManager::ensure_room(self.catalog.as_ref(), room).await?;

        // Nobody joined, nobody to tell.
        let Some(guard) = self.rooms.lock_existing(room).await else {
            return Ok(0);
        };
        let notified = guard.publish_except(event, identity);
        trace!(room = %room, identity = %identity, notified, "Typing relayed");
        Ok(notified)
    }
}
