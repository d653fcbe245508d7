//! Error taxonomy for the messaging core.

use crate::identity::{ConnectionId, Identity};
use thiserror::Error;

/// Errors returned by core operations.
///
/// Everything except [`ChatError::PersistenceFailure`] is rejected before any
/// side effect takes place.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The connection is not bound to an identity.
    #[error("Connection not bound: {0}")]
    NotBound(ConnectionId),

    /// The connection is already bound to a different identity.
    #[error("Connection {connection} already bound to {identity}")]
    AlreadyBound {
        /// The connection.
        connection: ConnectionId,
        /// The identity it is bound to.
        identity: Identity,
    },

    /// The room does not exist in the catalog.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Empty or otherwise invalid payload.
    #[error("Malformed payload: {0}")]
    MalformedPayload(&'static str),

    /// The backing store failed.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
}

/// Errors raised by storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Stable numeric code for the wire.
    #[must_use]
    pub fn code(&self) -> u16 {
        use murmur_protocol::codes;
        match self {
            ChatError::NotBound(_) => codes::NOT_BOUND,
            ChatError::AlreadyBound { .. } => codes::ALREADY_BOUND,
            ChatError::RoomNotFound(_) => codes::ROOM_NOT_FOUND,
            ChatError::MalformedPayload(_) => codes::MALFORMED_PAYLOAD,
            ChatError::PersistenceFailure(_) => codes::PERSISTENCE_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_to_persistence_failure() {
        let err: ChatError = StoreError::Unavailable("disk full".into()).into();
        assert!(matches!(err, ChatError::PersistenceFailure(_)));
        assert_eq!(err.code(), murmur_protocol::codes::PERSISTENCE_FAILURE);
        assert_eq!(err.to_string(), "Persistence failure: store unavailable: disk full");
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            ChatError::NotBound("c".into()),
            ChatError::AlreadyBound {
                connection: "c".into(),
                identity: "a".into(),
            },
            ChatError::RoomNotFound("r".into()),
            ChatError::MalformedPayload("empty"),
        ];
        let mut codes: Vec<u16> = errors.iter().map(ChatError::code).collect();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
