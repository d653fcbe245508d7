//! # murmur-protocol
//!
//! Wire protocol definitions for the Murmur group chat server.
//!
//! This crate defines the frames exchanged between chat clients and the
//! server, the codecs used to put them on the wire, and protocol versioning.
//!
//! ## Frames
//!
//! - `join` / `leave` - Room membership, answered by `roster` broadcasts
//! - `message` - Room messages, persisted and fanned out in order
//! - `typing` / `stopTyping` - Ephemeral typing signals
//! - `privateJoin` / `privateMessage` - Two-party sessions
//! - `getHistory` / `getPrivateHistory` / `getUnreadCounts` - Queries
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::message(1, "public", "hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoded, Encoding, ProtocolError};
pub use frames::{codes, ClientFrame, DirectMessage, RoomMessage, ServerFrame};
pub use version::{Version, PROTOCOL_VERSION};
