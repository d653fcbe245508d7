//! Messages and the events fanned out to connections.

use crate::identity::{now_millis, Identity, RoomSlug, Sequence};
use murmur_protocol::{DirectMessage, RoomMessage, ServerFrame};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Arc<Event>>;

/// Receiver half of a connection's outbound queue.
pub type Inbox = mpsc::UnboundedReceiver<Arc<Event>>;

/// Create a connection outbox and the matching receiver.
#[must_use]
pub fn outbox() -> (Outbox, Inbox) {
    mpsc::unbounded_channel()
}

/// A persisted room message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Room the message belongs to.
    pub room: RoomSlug,
    /// Sender identity.
    pub sender: Identity,
    /// Message text.
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Room-scoped sequence.
    pub sequence: Sequence,
}

/// A persisted private message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    /// Sender identity.
    pub from: Identity,
    /// Recipient identity.
    pub to: Identity,
    /// Message text.
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Pair-scoped sequence.
    pub sequence: Sequence,
}

/// An event delivered to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Full roster snapshot, in join order.
    Roster {
        /// Room slug.
        room: RoomSlug,
        /// Identities present.
        members: Vec<Identity>,
    },
    /// A persisted room message.
    Message(ChatMessage),
    /// Synthetic system notice.
    Notice {
        /// Room slug.
        room: RoomSlug,
        /// Notice text.
        text: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A member started typing.
    Typing {
        /// Room slug.
        room: RoomSlug,
        /// Who is typing.
        identity: Identity,
    },
    /// A member stopped typing.
    StopTyping {
        /// Room slug.
        room: RoomSlug,
        /// Who stopped.
        identity: Identity,
    },
    /// A persisted private message.
    PrivateMessage(PrivateMessage),
}

impl Event {
    /// Build the "joined" notice for a room.
    #[must_use]
    pub fn joined_notice(room: impl Into<RoomSlug>, identity: &Identity) -> Self {
        Event::Notice {
            room: room.into(),
            text: format!("{} joined the room!", identity),
            timestamp: now_millis(),
        }
    }

    /// Convert to the wire frame sent to clients.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        match self {
            Event::Roster { room, members } => ServerFrame::Roster {
                room: room.clone(),
                members: members.iter().map(|m| m.to_string()).collect(),
            },
            Event::Message(msg) => ServerFrame::Message {
                room: msg.room.clone(),
                sender: msg.sender.to_string(),
                text: msg.text.clone(),
                timestamp: msg.timestamp,
                sequence: msg.sequence,
            },
            Event::Notice {
                room,
                text,
                timestamp,
            } => ServerFrame::Notice {
                room: room.clone(),
                text: text.clone(),
                timestamp: *timestamp,
            },
            Event::Typing { room, identity } => ServerFrame::Typing {
                room: room.clone(),
                identity: identity.to_string(),
            },
            Event::StopTyping { room, identity } => ServerFrame::StopTyping {
                room: room.clone(),
                identity: identity.to_string(),
            },
            Event::PrivateMessage(msg) => ServerFrame::PrivateMessage {
                from: msg.from.to_string(),
                to: msg.to.to_string(),
                text: msg.text.clone(),
                timestamp: msg.timestamp,
                sequence: msg.sequence,
            },
        }
    }
}

impl From<&ChatMessage> for RoomMessage {
    fn from(msg: &ChatMessage) -> Self {
        RoomMessage {
            sender: msg.sender.to_string(),
            text: msg.text.clone(),
            timestamp: msg.timestamp,
            sequence: msg.sequence,
        }
    }
}

impl From<&PrivateMessage> for DirectMessage {
    fn from(msg: &PrivateMessage) -> Self {
        DirectMessage {
            from: msg.from.to_string(),
            to: msg.to.to_string(),
            text: msg.text.clone(),
            timestamp: msg.timestamp,
            sequence: msg.sequence,
        }
    }
}

/// Deliver one event to a set of outboxes, sharing the allocation.
///
/// Returns the number of outboxes that accepted it. Closed outboxes belong to
/// connections that are going away and are skipped.
pub fn deliver<'a>(event: Event, targets: impl IntoIterator<Item = &'a Outbox>) -> usize {
    let event = Arc::new(event);
    targets
        .into_iter()
        .filter(|tx| tx.send(Arc::clone(&event)).is_ok())
        .count()
}
