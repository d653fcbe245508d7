//! Message fan-out.
//!
//! A submitted message is persisted first and broadcast second, both while
//! holding the room's lock. That gives every room a single FIFO: members
//! observe messages in sequence order, and a message that failed to persist
//! is never seen by anyone.

use crate::error::ChatError;
use crate::event::{ChatMessage, Event};
use crate::identity::{now_millis, Identity, Sequence};
use crate::membership::MembershipManager;
use crate::room::RoomTable;
use crate::store::{MessageStore, RoomCatalog};
use std::sync::Arc;
use tracing::{trace, warn};

/// Default maximum message length in bytes.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4096;

/// Validate message text.
///
/// # Errors
///
/// Returns [`ChatError::MalformedPayload`] for blank or oversized text.
pub fn validate_text(text: &str, max_length: usize) -> Result<(), ChatError> {
    if text.trim().is_empty() {
        return Err(ChatError::MalformedPayload("Message text cannot be empty"));
    }
    if text.len() > max_length {
        return Err(ChatError::MalformedPayload("Message text too long"));
    }
    Ok(())
}

/// Persists room messages and broadcasts them to present members.
pub struct FanoutEngine {
    catalog: Arc<dyn RoomCatalog>,
    rooms: Arc<RoomTable>,
    store: Arc<dyn MessageStore>,
    max_message_length: usize,
}

impl FanoutEngine {
    /// Create a fan-out engine over shared room state.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn RoomCatalog>,
        rooms: Arc<RoomTable>,
        store: Arc<dyn MessageStore>,
        max_message_length: usize,
    ) -> Self {
        Self {
            catalog,
            rooms,
            store,
            max_message_length,
        }
    }

    /// Submit a message to a room.
    ///
    /// Returns the sequence assigned by the store. Delivery is at-most-once
    /// to connections joined at broadcast time; everyone else catches up
    /// through [`FanoutEngine::history`].
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`], [`ChatError::MalformedPayload`]
    /// or [`ChatError::PersistenceFailure`]. On error nothing is broadcast.
    pub async fn submit(
        &self,
        room: &str,
        sender: &Identity,
        text: &str,
    ) -> Result<Sequence, ChatError> {
        MembershipManager::ensure_room(self.catalog.as_ref(), room).await?;
        validate_text(text, self.max_message_length)?;

        let guard = self.rooms.lock(room).await;
        let timestamp = now_millis();

        let sequence = match self.store.persist(room, sender, text, timestamp).await {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!(room = %room, sender = %sender, error = %e, "Persist failed, message dropped");
                self.rooms.release(guard);
                return Err(e.into());
            }
        };

        let recipients = guard.publish(Event::Message(ChatMessage {
            room: room.to_string(),
            sender: sender.clone(),
            text: text.to_string(),
            timestamp,
            sequence,
        }));
        self.rooms.release(guard);

        trace!(room = %room, sequence, recipients, "Message fanned out");
        Ok(sequence)
    }

    /// Persisted messages of a room with a sequence above `since`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] or [`ChatError::PersistenceFailure`].
    pub async fn history(&self, room: &str, since: Sequence) -> Result<Vec<ChatMessage>, ChatError> {
        MembershipManager::ensure_room(self.catalog.as_ref(), room).await?;
        Ok(self.store.query(room, since).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::event::outbox;
    use crate::memory::{MemoryMessageStore, StaticRoomCatalog};
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn persist(
            &self,
            _room: &str,
            _sender: &Identity,
            _text: &str,
            _timestamp: u64,
        ) -> Result<Sequence, StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }

        async fn query(&self, _room: &str, _since: Sequence) -> Result<Vec<ChatMessage>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn engine(store: Arc<dyn MessageStore>) -> (FanoutEngine, Arc<RoomTable>) {
        let rooms = Arc::new(RoomTable::default());
        let engine = FanoutEngine::new(
            Arc::new(StaticRoomCatalog::with_default_rooms()),
            Arc::clone(&rooms),
            store,
            16,
        );
        (engine, rooms)
    }

    #[test]
    fn test_validate_text() {
        assert!(validate_text("hi", 16).is_ok());
        assert!(validate_text("", 16).is_err());
        assert!(validate_text(" \n\t", 16).is_err());
        assert!(validate_text(&"x".repeat(17), 16).is_err());
    }

    #[tokio::test]
    async fn test_submit_persists_then_broadcasts() {
        let (engine, rooms) = engine(Arc::new(MemoryMessageStore::new()));
        let (tx, mut rx) = outbox();
        let alice = Identity::from("alice");

        let mut guard = rooms.lock("public").await;
        guard.add(&"c1".into(), &alice, tx);
        rooms.release(guard);

        assert_eq!(engine.submit("public", &alice, "hi").await.unwrap(), 1);
        assert_eq!(engine.submit("public", &alice, "again").await.unwrap(), 2);

        let first = rx.try_recv().unwrap();
        assert!(matches!(&*first, Event::Message(m) if m.sequence == 1 && m.text == "hi"));
        let second = rx.try_recv().unwrap();
        assert!(matches!(&*second, Event::Message(m) if m.sequence == 2));

        let history = engine.history("public", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "again");
    }

    #[tokio::test]
    async fn test_submit_without_members_still_persists() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, rooms) = engine(store.clone());

        engine.submit("boys", &"bob".into(), "anyone?").await.unwrap();
        assert_eq!(store.head("boys"), 1);
        assert_eq!(rooms.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejections_have_no_side_effects() {
        let store = Arc::new(MemoryMessageStore::new());
        let (engine, _rooms) = engine(store.clone());
        let alice = Identity::from("alice");

        assert!(matches!(
            engine.submit("nowhere", &alice, "hi").await,
            Err(ChatError::RoomNotFound(_))
        ));
        assert!(matches!(
            engine.submit("public", &alice, "   ").await,
            Err(ChatError::MalformedPayload(_))
        ));
        assert_eq!(store.head("public"), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_skips_broadcast() {
        let (engine, rooms) = engine(Arc::new(BrokenStore));
        let (tx, mut rx) = outbox();
        let alice = Identity::from("alice");

        let mut guard = rooms.lock("public").await;
        guard.add(&"c1".into(), &alice, tx);
        rooms.release(guard);

        let err = engine.submit("public", &alice, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::PersistenceFailure(_)));
        assert!(rx.try_recv().is_err());
    }
}
