//! Frame types for the Murmur protocol.
//!
//! Frames are the unit of communication between chat clients and the server.
//! Client and server speak different vocabularies, so each direction has its
//! own enum. Both are internally tagged by `type` and use camelCase names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire error codes carried by [`ServerFrame::Error`].
pub mod codes {
    /// The frame could not be decoded or was not expected in this state.
    pub const MALFORMED_FRAME: u16 = 1001;
    /// The connection is not bound to an identity.
    pub const NOT_BOUND: u16 = 1002;
    /// The connection is already bound to a different identity.
    pub const ALREADY_BOUND: u16 = 1003;
    /// The room does not exist.
    pub const ROOM_NOT_FOUND: u16 = 1004;
    /// The message text was empty or invalid.
    pub const MALFORMED_PAYLOAD: u16 = 1005;
    /// The message could not be persisted.
    pub const PERSISTENCE_FAILURE: u16 = 1006;
    /// The connect token was rejected.
    pub const UNAUTHORIZED: u16 = 1007;
    /// The client speaks an incompatible protocol version.
    pub const INCOMPATIBLE_VERSION: u16 = 1008;
}

/// A persisted room message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Sender identity.
    pub sender: String,
    /// Message text.
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Room-scoped sequence number.
    pub sequence: u64,
}

/// A persisted private message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Sender identity.
    pub from: String,
    /// Recipient identity.
    pub to: String,
    /// Message text.
    pub text: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Pair-scoped sequence number.
    pub sequence: u64,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Initial handshake carrying the session token.
    Connect {
        /// Protocol major version spoken by the client.
        version: u8,
        /// Token handed out by the session provider.
        token: String,
    },

    /// Join a room.
    Join {
        /// Request ID for acknowledgment.
        id: u64,
        /// Room slug.
        room: String,
    },

    /// Leave a room.
    Leave {
        /// Request ID for acknowledgment.
        id: u64,
        /// Room slug.
        room: String,
    },

    /// Submit a message to a room.
    Message {
        /// Request ID; the ack carries the assigned sequence.
        id: u64,
        /// Room slug.
        room: String,
        /// Message text.
        text: String,
    },

    /// The user started typing.
    Typing {
        /// Room slug.
        room: String,
    },

    /// The user stopped typing.
    StopTyping {
        /// Room slug.
        room: String,
    },

    /// Subscribe to the private session with another identity.
    PrivateJoin {
        /// Request ID for acknowledgment.
        id: u64,
        /// The other participant.
        with: String,
    },

    /// Send a private message.
    PrivateMessage {
        /// Request ID; the ack carries the assigned sequence.
        id: u64,
        /// Recipient identity.
        to: String,
        /// Message text.
        text: String,
    },

    /// Query room history.
    GetHistory {
        /// Request ID echoed in the response.
        id: u64,
        /// Room slug.
        room: String,
        /// Only messages with a sequence above this are returned.
        #[serde(default)]
        since: u64,
    },

    /// Query private history with another identity.
    GetPrivateHistory {
        /// Request ID echoed in the response.
        id: u64,
        /// The other participant.
        with: String,
    },

    /// Query unread counts for every room of the caller.
    GetUnreadCounts {
        /// Request ID echoed in the response.
        id: u64,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Identity the connection is bound to.
        identity: String,
        /// Negotiated protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        /// How long clients should show a typing indicator without renewal.
        typing_timeout: u32,
    },

    /// Acknowledgment of a request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
        /// Sequence assigned to a persisted message, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Full roster snapshot of a room, in join order.
    Roster {
        /// Room slug.
        room: String,
        /// Identities currently present.
        members: Vec<String>,
    },

    /// A message broadcast to a room.
    Message {
        /// Room slug.
        room: String,
        /// Sender identity.
        sender: String,
        /// Message text.
        text: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
        /// Room-scoped sequence number.
        sequence: u64,
    },

    /// A synthetic system notice, never persisted.
    Notice {
        /// Room slug.
        room: String,
        /// Notice text.
        text: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },

    /// Another member is typing.
    Typing {
        /// Room slug.
        room: String,
        /// Who is typing.
        identity: String,
    },

    /// Another member stopped typing.
    StopTyping {
        /// Room slug.
        room: String,
        /// Who stopped.
        identity: String,
    },

    /// A private message for a session this connection subscribed to.
    PrivateMessage {
        /// Sender identity.
        from: String,
        /// Recipient identity.
        to: String,
        /// Message text.
        text: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
        /// Pair-scoped sequence number.
        sequence: u64,
    },

    /// Response to [`ClientFrame::GetHistory`].
    History {
        /// Request ID.
        id: u64,
        /// Room slug.
        room: String,
        /// Messages in sequence order.
        messages: Vec<RoomMessage>,
    },

    /// Response to [`ClientFrame::GetPrivateHistory`].
    PrivateHistory {
        /// Request ID.
        id: u64,
        /// The other participant.
        with: String,
        /// Messages in sequence order.
        messages: Vec<DirectMessage>,
    },

    /// Response to [`ClientFrame::GetUnreadCounts`].
    UnreadCounts {
        /// Request ID.
        id: u64,
        /// Unread message count per room slug.
        counts: BTreeMap<String, u64>,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Event name, for logging.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "connect",
            ClientFrame::Join { .. } => "join",
            ClientFrame::Leave { .. } => "leave",
            ClientFrame::Message { .. } => "message",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::StopTyping { .. } => "stopTyping",
            ClientFrame::PrivateJoin { .. } => "privateJoin",
            ClientFrame::PrivateMessage { .. } => "privateMessage",
            ClientFrame::GetHistory { .. } => "getHistory",
            ClientFrame::GetPrivateHistory { .. } => "getPrivateHistory",
            ClientFrame::GetUnreadCounts { .. } => "getUnreadCounts",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: impl Into<String>) -> Self {
        ClientFrame::Connect {
            version,
            token: token.into(),
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, room: impl Into<String>) -> Self {
        ClientFrame::Join {
            id,
            room: room.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, room: impl Into<String>) -> Self {
        ClientFrame::Leave {
            id,
            room: room.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(id: u64, room: impl Into<String>, text: impl Into<String>) -> Self {
        ClientFrame::Message {
            id,
            room: room.into(),
            text: text.into(),
        }
    }

    /// Create a new PrivateMessage frame.
    #[must_use]
    pub fn private_message(id: u64, to: impl Into<String>, text: impl Into<String>) -> Self {
        ClientFrame::PrivateMessage {
            id,
            to: to.into(),
            text: text.into(),
        }
    }
}

impl ServerFrame {
    /// Event name, for logging and metrics labels.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Ack { .. } => "ack",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Roster { .. } => "roster",
            ServerFrame::Message { .. } => "message",
            ServerFrame::Notice { .. } => "notice",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::StopTyping { .. } => "stopTyping",
            ServerFrame::PrivateMessage { .. } => "privateMessage",
            ServerFrame::History { .. } => "history",
            ServerFrame::PrivateHistory { .. } => "privateHistory",
            ServerFrame::UnreadCounts { .. } => "unreadCounts",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerFrame::Ack { id, sequence: None }
    }

    /// Create an Ack frame carrying an assigned sequence.
    #[must_use]
    pub fn ack_sequence(id: u64, sequence: u64) -> Self {
        ServerFrame::Ack {
            id,
            sequence: Some(sequence),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_names() {
        assert_eq!(ClientFrame::join(1, "public").event(), "join");
        assert_eq!(
            ClientFrame::StopTyping {
                room: "public".into()
            }
            .event(),
            "stopTyping"
        );
    }

    #[test]
    fn test_json_tags_are_camel_case() {
        let frame = ClientFrame::PrivateJoin {
            id: 3,
            with: "bob".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "privateJoin");

        let frame = ServerFrame::Connected {
            connection_id: "conn_1".into(),
            identity: "alice".into(),
            version: 1,
            heartbeat: 30_000,
            typing_timeout: 3_000,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["connectionId"], "conn_1");
        assert_eq!(json["typingTimeout"], 3_000);
    }

    #[test]
    fn test_history_since_defaults_to_zero() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"getHistory","id":7,"room":"public"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::GetHistory {
                id: 7,
                room: "public".into(),
                since: 0
            }
        );
    }

    #[test]
    fn test_ack_without_sequence_omits_field() {
        let json = serde_json::to_value(ServerFrame::ack(9)).unwrap();
        assert!(json.get("sequence").is_none());
        let json = serde_json::to_value(ServerFrame::ack_sequence(9, 4)).unwrap();
        assert_eq!(json["sequence"], 4);
    }
}
