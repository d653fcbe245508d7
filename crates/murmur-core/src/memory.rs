//! In-memory collaborators.
//!
//! Suitable for tests, benchmarks and single-process deployments that can
//! afford to lose history on restart.

use crate::error::StoreError;
use crate::event::{ChatMessage, PrivateMessage};
use crate::identity::{Identity, RoomSlug, Sequence};
use crate::private::SessionKey;
use crate::store::{
    IdentityProvider, MessageStore, PrivateMessageStore, ReadMarkerStore, RoomCatalog, RoomInfo,
};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

/// Room message log held in memory.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<RoomSlug, Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence assigned in a room, 0 if empty.
    #[must_use]
    pub fn head(&self, room: &str) -> Sequence {
        self.rooms
            .get(room)
            .map(|log| log.len() as Sequence)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn persist(
        &self,
        room: &str,
        sender: &Identity,
        text: &str,
        timestamp: u64,
    ) -> Result<Sequence, StoreError> {
        // The shard lock covers both the length read and the push.
        let mut log = self.rooms.entry(room.to_string()).or_default();
        let sequence = log.len() as Sequence + 1;
        log.push(ChatMessage {
            room: room.to_string(),
            sender: sender.clone(),
            text: text.to_string(),
            timestamp,
            sequence,
        });
        trace!(room = %room, sequence, "Persisted message");
        Ok(sequence)
    }

    async fn query(&self, room: &str, since: Sequence) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .rooms
            .get(room)
            .map(|log| log.iter().skip(since as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn count_since(&self, room: &str, since: Sequence) -> Result<u64, StoreError> {
        Ok(self.head(room).saturating_sub(since))
    }
}

/// Private message log held in memory.
#[derive(Debug, Default)]
pub struct MemoryPrivateStore {
    pairs: DashMap<SessionKey, Vec<PrivateMessage>>,
}

impl MemoryPrivateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrivateMessageStore for MemoryPrivateStore {
    async fn persist(
        &self,
        from: &Identity,
        to: &Identity,
        text: &str,
        timestamp: u64,
    ) -> Result<Sequence, StoreError> {
        let key = SessionKey::derive(from, to);
        let mut log = self.pairs.entry(key).or_default();
        let sequence = log.len() as Sequence + 1;
        log.push(PrivateMessage {
            from: from.clone(),
            to: to.clone(),
            text: text.to_string(),
            timestamp,
            sequence,
        });
        Ok(sequence)
    }

    async fn query(&self, key: &SessionKey) -> Result<Vec<PrivateMessage>, StoreError> {
        Ok(self
            .pairs
            .get(key)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }
}

/// Read markers held in memory.
#[derive(Debug, Default)]
pub struct MemoryReadMarkers {
    markers: DashMap<(Identity, RoomSlug), Sequence>,
}

impl MemoryReadMarkers {
    /// Create an empty marker table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReadMarkerStore for MemoryReadMarkers {
    async fn get(&self, identity: &Identity, room: &str) -> Result<Sequence, StoreError> {
        Ok(self
            .markers
            .get(&(identity.clone(), room.to_string()))
            .map(|m| *m)
            .unwrap_or(0))
    }

    async fn advance(
        &self,
        identity: &Identity,
        room: &str,
        upto: Sequence,
    ) -> Result<Sequence, StoreError> {
        let mut marker = self
            .markers
            .entry((identity.clone(), room.to_string()))
            .or_insert(0);
        *marker = (*marker).max(upto);
        Ok(*marker)
    }
}

/// The rooms every fresh deployment starts with.
#[must_use]
pub fn default_rooms() -> Vec<RoomInfo> {
    vec![
        RoomInfo::new("public", "Public chat"),
        RoomInfo::new("girls", "Girls"),
        RoomInfo::new("boys", "Boys"),
        RoomInfo::new("hackers", "Hackers meetup"),
        RoomInfo::new("friendly", "Friendly"),
    ]
}

/// A fixed room catalog. Every identity is associated with every room.
#[derive(Debug, Clone)]
pub struct StaticRoomCatalog {
    rooms: Vec<RoomInfo>,
}

impl StaticRoomCatalog {
    /// Create a catalog from a list of rooms.
    #[must_use]
    pub fn new(rooms: Vec<RoomInfo>) -> Self {
        Self { rooms }
    }

    /// Create a catalog holding [`default_rooms`].
    #[must_use]
    pub fn with_default_rooms() -> Self {
        Self::new(default_rooms())
    }
}

impl Default for StaticRoomCatalog {
    fn default() -> Self {
        Self::with_default_rooms()
    }
}

#[async_trait]
impl RoomCatalog for StaticRoomCatalog {
    async fn room(&self, slug: &str) -> Result<Option<RoomInfo>, StoreError> {
        Ok(self.rooms.iter().find(|r| r.slug == slug).cloned())
    }

    async fn rooms_for(&self, _identity: &Identity) -> Result<Vec<RoomSlug>, StoreError> {
        Ok(self.rooms.iter().map(|r| r.slug.clone()).collect())
    }
}

/// Development identity provider: any non-blank token is the identity.
///
/// Only for local use and tests. Production deployments plug in a provider
/// that checks tokens against the session service.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedTokenProvider;

#[async_trait]
impl IdentityProvider for TrustedTokenProvider {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let token = token.trim();
        Ok((!token.is_empty()).then(|| Identity::new(token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sequences_start_at_one_per_room() {
        let store = MemoryMessageStore::new();
        let alice = Identity::from("alice");

        assert_eq!(store.persist("public", &alice, "a", 1).await.unwrap(), 1);
        assert_eq!(store.persist("public", &alice, "b", 2).await.unwrap(), 2);
        assert_eq!(store.persist("boys", &alice, "c", 3).await.unwrap(), 1);

        let tail = store.query("public", 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].text, "b");
        assert_eq!(store.count_since("public", 0).await.unwrap(), 2);
        assert_eq!(store.count_since("public", 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_persist_has_no_gaps() {
        let store = Arc::new(MemoryMessageStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let sender = Identity::new(format!("user-{}", i));
                store.persist("public", &sender, "x", 0).await.unwrap()
            }));
        }

        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_private_store_is_keyed_by_pair() {
        let store = MemoryPrivateStore::new();
        let (a, b, c) = (Identity::from("a"), Identity::from("b"), Identity::from("c"));

        assert_eq!(store.persist(&a, &b, "1", 0).await.unwrap(), 1);
        assert_eq!(store.persist(&b, &a, "2", 0).await.unwrap(), 2);
        assert_eq!(store.persist(&a, &c, "3", 0).await.unwrap(), 1);

        let history = store.query(&SessionKey::derive(&b, &a)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, b);
    }

    #[tokio::test]
    async fn test_read_marker_never_decreases() {
        let markers = MemoryReadMarkers::new();
        let alice = Identity::from("alice");

        assert_eq!(markers.get(&alice, "public").await.unwrap(), 0);
        assert_eq!(markers.advance(&alice, "public", 5).await.unwrap(), 5);
        assert_eq!(markers.advance(&alice, "public", 3).await.unwrap(), 5);
        assert_eq!(markers.get(&alice, "public").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticRoomCatalog::with_default_rooms();
        assert!(catalog.room("public").await.unwrap().is_some());
        assert!(catalog.room("nowhere").await.unwrap().is_none());
        assert_eq!(
            catalog.rooms_for(&Identity::from("x")).await.unwrap().len(),
            5
        );
    }

    #[tokio::test]
    async fn test_trusted_provider_rejects_blank_tokens() {
        let provider = TrustedTokenProvider;
        assert_eq!(
            provider.resolve(" alice ").await.unwrap(),
            Some(Identity::from("alice"))
        );
        assert_eq!(provider.resolve("   ").await.unwrap(), None);
    }
}
