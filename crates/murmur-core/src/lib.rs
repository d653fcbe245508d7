//! # murmur-core
//!
//! Room-based group messaging for the Murmur chat server.
//!
//! This crate holds everything between a bound connection and the durable
//! stores:
//!
//! - **Registry** - Which connection belongs to which identity
//! - **Membership** - Room rosters, join/leave notices
//! - **Fan-out** - Persist-then-broadcast of room messages
//! - **Private** - Two-party sessions keyed by the canonical pair
//! - **Typing** - Ephemeral typing indicators
//! - **Unread** - Per-room unread counts from read markers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │     │   Stores    │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! Durable state (messages, read markers, the room catalog) sits behind the
//! traits in [`store`]; [`memory`] provides in-process implementations.

pub mod error;
pub mod event;
pub mod fanout;
pub mod hub;
pub mod identity;
pub mod membership;
pub mod memory;
pub mod private;
pub mod registry;
pub mod room;
pub mod store;
pub mod typing;
pub mod unread;

pub use error::{ChatError, StoreError};
pub use event::{outbox, ChatMessage, Event, Inbox, Outbox, PrivateMessage};
pub use fanout::{FanoutEngine, DEFAULT_MAX_MESSAGE_LENGTH};
pub use hub::{Collaborators, Hub, HubConfig, HubStats};
pub use identity::{validate_room_slug, ConnectionId, Identity, RoomSlug, Sequence};
pub use membership::MembershipManager;
pub use private::{PrivateRouter, SessionKey};
pub use registry::{ConnectionRegistry, Unbound};
pub use room::{Room, RoomTable};
pub use store::{
    IdentityProvider, MessageStore, PrivateMessageStore, ReadMarkerStore, RoomCatalog, RoomInfo,
};
pub use typing::{TypingBroadcaster, DEFAULT_TYPING_TIMEOUT};
pub use unread::UnreadAggregator;
