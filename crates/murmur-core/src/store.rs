//! Collaborator interfaces.
//!
//! The core does not own durable state. Messages, private messages, read
//! markers, the room catalog and identity resolution all live behind these
//! traits so that a deployment can back them with a database while tests use
//! the in-memory versions from [`crate::memory`].

use crate::error::StoreError;
use crate::event::{ChatMessage, PrivateMessage};
use crate::identity::{Identity, RoomSlug, Sequence};
use crate::private::SessionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Durable room message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message and return its sequence.
    ///
    /// Assignment must be atomic with the insert: per room, sequences start
    /// at 1 and have no gaps or duplicates under concurrent callers.
    async fn persist(
        &self,
        room: &str,
        sender: &Identity,
        text: &str,
        timestamp: u64,
    ) -> Result<Sequence, StoreError>;

    /// Messages of `room` with a sequence above `since`, in sequence order.
    async fn query(&self, room: &str, since: Sequence) -> Result<Vec<ChatMessage>, StoreError>;

    /// Number of messages of `room` with a sequence above `since`.
    async fn count_since(&self, room: &str, since: Sequence) -> Result<u64, StoreError> {
        Ok(self.query(room, since).await?.len() as u64)
    }
}

/// Durable private message log, sequenced per canonical pair.
#[async_trait]
pub trait PrivateMessageStore: Send + Sync {
    /// Append a private message and return its pair-scoped sequence.
    async fn persist(
        &self,
        from: &Identity,
        to: &Identity,
        text: &str,
        timestamp: u64,
    ) -> Result<Sequence, StoreError>;

    /// All messages exchanged within a pair, in sequence order.
    async fn query(&self, key: &SessionKey) -> Result<Vec<PrivateMessage>, StoreError>;
}

/// Per-identity, per-room last-read sequence.
#[async_trait]
pub trait ReadMarkerStore: Send + Sync {
    /// Current marker, 0 if the identity never read the room.
    async fn get(&self, identity: &Identity, room: &str) -> Result<Sequence, StoreError>;

    /// Raise the marker to `max(current, upto)` atomically and return the
    /// stored value.
    async fn advance(
        &self,
        identity: &Identity,
        room: &str,
        upto: Sequence,
    ) -> Result<Sequence, StoreError>;
}

/// Room metadata, owned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Unique slug.
    pub slug: RoomSlug,
    /// Display title.
    pub title: String,
}

impl RoomInfo {
    /// Create room metadata.
    #[must_use]
    pub fn new(slug: impl Into<RoomSlug>, title: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            title: title.into(),
        }
    }
}

/// Read-only room catalog.
#[async_trait]
pub trait RoomCatalog: Send + Sync {
    /// Look up a room by slug.
    async fn room(&self, slug: &str) -> Result<Option<RoomInfo>, StoreError>;

    /// Rooms an identity is associated with, for unread aggregation.
    async fn rooms_for(&self, identity: &Identity) -> Result<Vec<RoomSlug>, StoreError>;
}

/// Resolves session tokens to verified identities.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The identity behind `token`, or `None` if the token is not valid.
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, StoreError>;
}
