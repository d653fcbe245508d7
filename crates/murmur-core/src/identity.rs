//! Identifiers used throughout the core.
//!
//! Identities are owned by an external session provider; the core only ever
//! sees their opaque identifier. Connection ids are minted per transport
//! session and never reused.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum room slug length.
pub const MAX_ROOM_SLUG_LENGTH: usize = 64;

/// A room slug.
pub type RoomSlug = String;

/// A per-room or per-pair message ordinal. The first message is 1.
pub type Sequence = u64;

/// Atomic counter for ensuring unique ids even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An opaque user identifier.
///
/// Identities order byte-wise lexicographically. That ordering is what makes
/// private session keys canonical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", timestamp.wrapping_add(counter)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Validate a room slug.
///
/// # Errors
///
/// Returns an error message if the slug is invalid.
pub fn validate_room_slug(slug: &str) -> Result<(), &'static str> {
    if slug.is_empty() {
        return Err("Room slug cannot be empty");
    }
    if slug.len() > MAX_ROOM_SLUG_LENGTH {
        return Err("Room slug too long");
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err("Room slug contains invalid characters");
    }
    Ok(())
}
