//! The chat hub.
//!
//! The hub owns every component of the core and exposes their operations
//! keyed by connection, which is what a transport handler has at hand. It
//! also drives the disconnect cascade: registry first, then rooms, then
//! private sessions.

use crate::error::ChatError;
use crate::event::{ChatMessage, Outbox, PrivateMessage};
use crate::fanout::{FanoutEngine, DEFAULT_MAX_MESSAGE_LENGTH};
use crate::identity::{ConnectionId, Identity, RoomSlug, Sequence};
use crate::membership::MembershipManager;
use crate::memory::{MemoryMessageStore, MemoryPrivateStore, MemoryReadMarkers, StaticRoomCatalog};
use crate::private::{PrivateRouter, SessionKey};
use crate::registry::{ConnectionRegistry, Unbound};
use crate::room::RoomTable;
use crate::store::{MessageStore, PrivateMessageStore, ReadMarkerStore, RoomCatalog};
use crate::typing::TypingBroadcaster;
use crate::unread::UnreadAggregator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum message text length in bytes.
    pub max_message_length: usize,
    /// Whether to drop room state once a room has no connections.
    pub retire_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            retire_empty_rooms: true,
        }
    }
}

/// External collaborators the hub is built on.
#[derive(Clone)]
pub struct Collaborators {
    /// Room catalog.
    pub catalog: Arc<dyn RoomCatalog>,
    /// Room message log.
    pub messages: Arc<dyn MessageStore>,
    /// Private message log.
    pub private_messages: Arc<dyn PrivateMessageStore>,
    /// Read markers.
    pub read_markers: Arc<dyn ReadMarkerStore>,
}

impl Collaborators {
    /// In-memory collaborators with the default room catalog.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            catalog: Arc::new(StaticRoomCatalog::with_default_rooms()),
            messages: Arc::new(MemoryMessageStore::new()),
            private_messages: Arc::new(MemoryPrivateStore::new()),
            read_markers: Arc::new(MemoryReadMarkers::new()),
        }
    }
}

/// The central chat hub.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomTable>,
    membership: MembershipManager,
    fanout: FanoutEngine,
    private: PrivateRouter,
    typing: TypingBroadcaster,
    unread: UnreadAggregator,
}

impl Hub {
    /// Create a hub with in-memory collaborators and default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Collaborators::in_memory(), HubConfig::default())
    }

    /// Create a hub over the given collaborators.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);

        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomTable::new(config.retire_empty_rooms));
        let Collaborators {
            catalog,
            messages,
            private_messages,
            read_markers,
        } = collaborators;

        Self {
            membership: MembershipManager::new(
                Arc::clone(&catalog),
                Arc::clone(&registry),
                Arc::clone(&rooms),
            ),
            fanout: FanoutEngine::new(
                Arc::clone(&catalog),
                Arc::clone(&rooms),
                Arc::clone(&messages),
                config.max_message_length,
            ),
            private: PrivateRouter::new(
                Arc::clone(&registry),
                private_messages,
                config.max_message_length,
            ),
            typing: TypingBroadcaster::new(Arc::clone(&catalog), Arc::clone(&rooms)),
            unread: UnreadAggregator::new(catalog, messages, read_markers),
            registry,
            rooms,
        }
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.registry.connection_count(),
            identity_count: self.registry.identity_count(),
            active_rooms: self.rooms.active_count(),
            private_sessions: self.private.session_count(),
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bind a new connection to a verified identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::AlreadyBound`] if the connection belongs to
    /// another identity.
    pub fn connect(
        &self,
        connection_id: &ConnectionId,
        identity: &Identity,
        outbox: Outbox,
    ) -> Result<(), ChatError> {
        self.registry.bind(connection_id, identity, outbox)
    }

    /// Tear down a connection and everything hanging off it.
    ///
    /// Unknown connections are ignored. Returns what was unbound.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Option<Unbound> {
        let unbound = match self.registry.unbind(connection_id) {
            Ok(unbound) => unbound,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Disconnect of unbound connection");
                return None;
            }
        };

        self.membership.cleanup(connection_id, &unbound).await;
        if unbound.last_connection {
            self.private.unsubscribe_all(&unbound.identity).await;
        }

        debug!(connection = %connection_id, identity = %unbound.identity, "Disconnected");
        Some(unbound)
    }

    /// Join a room. Returns the roster after the join.
    ///
    /// # Errors
    ///
    /// See [`MembershipManager::join`].
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        room: &str,
    ) -> Result<Vec<Identity>, ChatError> {
        self.membership.join(connection_id, room).await
    }

    /// Leave a room.
    ///
    /// # Errors
    ///
    /// See [`MembershipManager::leave`].
    pub async fn leave(&self, connection_id: &ConnectionId, room: &str) -> Result<(), ChatError> {
        self.membership.leave(connection_id, room).await
    }

    /// Roster of a room, in join order.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room does not exist.
    pub async fn roster(&self, room: &str) -> Result<Vec<Identity>, ChatError> {
        self.membership.roster(room).await
    }

    /// Submit a message to a room on behalf of a connection.
    ///
    /// # Errors
    ///
    /// See [`FanoutEngine::submit`]; also [`ChatError::NotBound`].
    pub async fn submit(
        &self,
        connection_id: &ConnectionId,
        room: &str,
        text: &str,
    ) -> Result<Sequence, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.fanout.submit(room, &identity, text).await
    }

    /// Relay a typing signal.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] or [`ChatError::RoomNotFound`].
    pub async fn start_typing(
        &self,
        connection_id: &ConnectionId,
        room: &str,
    ) -> Result<usize, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.typing.notify_typing(room, &identity).await
    }

    /// Relay a stop-typing signal.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] or [`ChatError::RoomNotFound`].
    pub async fn stop_typing(
        &self,
        connection_id: &ConnectionId,
        room: &str,
    ) -> Result<usize, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.typing.notify_stop_typing(room, &identity).await
    }

    /// Subscribe the connection's identity to a private session.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] or [`ChatError::MalformedPayload`].
    pub async fn private_join(
        &self,
        connection_id: &ConnectionId,
        other: &Identity,
    ) -> Result<SessionKey, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.private.join(&identity, other).await
    }

    /// Send a private message.
    ///
    /// # Errors
    ///
    /// See [`PrivateRouter::send`]; also [`ChatError::NotBound`].
    pub async fn private_send(
        &self,
        connection_id: &ConnectionId,
        to: &Identity,
        text: &str,
    ) -> Result<Sequence, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.private.send(&identity, to, text).await
    }

    /// Fetch room history and mark it read for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`], [`ChatError::RoomNotFound`] or
    /// [`ChatError::PersistenceFailure`].
    pub async fn history(
        &self,
        connection_id: &ConnectionId,
        room: &str,
        since: Sequence,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        let messages = self.fanout.history(room, since).await?;
        if let Some(last) = messages.last() {
            self.unread.mark_read(&identity, room, last.sequence).await?;
        }
        Ok(messages)
    }

    /// Fetch private history with another identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] or [`ChatError::PersistenceFailure`].
    pub async fn private_history(
        &self,
        connection_id: &ConnectionId,
        other: &Identity,
    ) -> Result<Vec<PrivateMessage>, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.private.history(&identity, other).await
    }

    /// Unread counts of the connection's identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotBound`] or [`ChatError::PersistenceFailure`].
    pub async fn unread_counts(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<BTreeMap<RoomSlug, u64>, ChatError> {
        let identity = self.registry.lookup(connection_id)?;
        self.unread.compute_unread(&identity).await
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    /// Number of bound connections.
    pub connection_count: usize,
    /// Number of distinct identities online.
    pub identity_count: usize,
    /// Number of rooms with live state.
    pub active_rooms: usize,
    /// Number of private sessions with subscribers.
    pub private_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::outbox;

    #[tokio::test]
    async fn test_disconnect_unknown_connection_is_noop() {
        let hub = Hub::in_memory();
        assert!(hub.disconnect(&"ghost".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_operations_require_binding() {
        let hub = Hub::in_memory();
        let ghost = ConnectionId::new("ghost");

        assert!(matches!(hub.submit(&ghost, "public", "hi").await, Err(ChatError::NotBound(_))));
        assert!(matches!(hub.start_typing(&ghost, "public").await, Err(ChatError::NotBound(_))));
        assert!(matches!(hub.unread_counts(&ghost).await, Err(ChatError::NotBound(_))));
    }

    #[tokio::test]
    async fn test_stats() {
        let hub = Hub::in_memory();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        hub.connect(&"c1".into(), &"alice".into(), tx1).unwrap();
        hub.connect(&"c2".into(), &"alice".into(), tx2).unwrap();
        hub.join(&"c1".into(), "public").await.unwrap();
        hub.join(&"c2".into(), "hackers").await.unwrap();
        hub.private_join(&"c1".into(), &"bob".into()).await.unwrap();

        let stats = hub.stats();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.identity_count, 1);
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.private_sessions, 1);

        hub.disconnect(&"c1".into()).await.unwrap();
        hub.disconnect(&"c2".into()).await.unwrap();
        assert_eq!(
            hub.stats(),
            HubStats {
                connection_count: 0,
                identity_count: 0,
                active_rooms: 0,
                private_sessions: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_private_subscription_survives_other_connections() {
        let hub = Hub::in_memory();
        let (tx1, _rx1) = outbox();
        let (tx2, mut rx2) = outbox();
        let (tx3, _rx3) = outbox();

        hub.connect(&"c1".into(), &"alice".into(), tx1).unwrap();
        hub.connect(&"c2".into(), &"alice".into(), tx2).unwrap();
        hub.connect(&"c3".into(), &"bob".into(), tx3).unwrap();
        hub.private_join(&"c1".into(), &"bob".into()).await.unwrap();

        hub.disconnect(&"c1".into()).await;
        hub.private_send(&"c3".into(), &"alice".into(), "still there?")
            .await
            .unwrap();
        assert!(rx2.try_recv().is_ok());
    }
}
