//! Unread counts.
//!
//! Sequences are gapless, so the number of unread messages in a room is
//! simply the number of persisted messages above the identity's marker.

use crate::error::ChatError;
use crate::identity::{Identity, RoomSlug, Sequence};
use crate::store::{MessageStore, ReadMarkerStore, RoomCatalog};
use futures_util::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Computes per-room unread counts and advances read markers.
pub struct UnreadAggregator {
    catalog: Arc<dyn RoomCatalog>,
    messages: Arc<dyn MessageStore>,
    markers: Arc<dyn ReadMarkerStore>,
}

impl UnreadAggregator {
    /// Create an aggregator.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn RoomCatalog>,
        messages: Arc<dyn MessageStore>,
        markers: Arc<dyn ReadMarkerStore>,
    ) -> Self {
        Self {
            catalog,
            messages,
            markers,
        }
    }

    /// Unread count for every room associated with `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::PersistenceFailure`] if any store fails.
    pub async fn compute_unread(
        &self,
        identity: &Identity,
    ) -> Result<BTreeMap<RoomSlug, u64>, ChatError> {
        let rooms = self.catalog.rooms_for(identity).await?;

        let counts = try_join_all(rooms.into_iter().map(|room| async move {
            let marker = self.markers.get(identity, &room).await?;
            let count = self.messages.count_since(&room, marker).await?;
            Ok::<_, ChatError>((room, count))
        }))
        .await?;

        trace!(identity = %identity, rooms = counts.len(), "Computed unread counts");
        Ok(counts.into_iter().collect())
    }

    /// Advance the marker of `identity` in `room` to at least `upto`.
    ///
    /// Returns the marker now stored. Markers never move backwards.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::PersistenceFailure`] if the marker store fails.
    pub async fn mark_read(
        &self,
        identity: &Identity,
        room: &str,
        upto: Sequence,
    ) -> Result<Sequence, ChatError> {
        Ok(self.markers.advance(identity, room, upto).await?)
    }
}
