//! Identifier types for flows, sessions and message deduplication.
//!
//! All identifiers are newtypes so that a `SessionId` can never be passed where a
//! `FlowId` is expected, even though both end up as map keys in the same places.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid identifier: {0}")]
pub struct ParseIdError(String);

/// Unique identifier of a flow instance.
///
/// Generated randomly when a flow is created. It stays the same for the
/// whole life of the flow, including retries and node restarts, and is the
/// key under which its checkpoint is stored.
///
/// # Examples
///
/// ```
/// use flowmachine_core::id::FlowId;
///
/// let id = FlowId::random();
/// let parsed: FlowId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Generate a fresh random flow id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Lower 64 bits of the id, used to derive deterministic error ids.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // truncation is the point
    pub const fn low_bits(&self) -> u64 {
        self.0.as_u128() as u64
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlowId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseIdError(format!("{s}: {e}")))
    }
}

/// Identifier of one leg of a peer-to-peer conversation.
///
/// Each side of a session picks its own id, so a message always names the
/// recipient's id. Ids come from the operating system's secure random source
/// because a guessable id would let a peer inject messages into someone
/// else's session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a session id from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Generate a fresh session id from the secure random source.
    #[must_use]
    pub fn random() -> Self {
        Self(OsRng.next_u64())
    }

    /// The raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| ParseIdError(format!("{s}: {e}")))
    }
}

/// Identifier of an inbound message, as assigned by the messaging layer.
///
/// Two deliveries carrying the same id are the same message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeduplicationId(String);

impl DeduplicationId {
    /// Create a new deduplication id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deduplication id attached to an outgoing session message.
///
/// Derived from the sending session and a per-session sequence number, so a
/// flow that replays from a checkpoint sends messages with the same ids it
/// used the first time and the receiver can drop the repeats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderDeduplicationId {
    /// Our side of the session.
    pub session_id: SessionId,
    /// Position of the message in the session's outbound stream.
    pub sequence: u64,
}

impl SenderDeduplicationId {
    /// Create a new sender deduplication id.
    #[must_use]
    pub const fn new(session_id: SessionId, sequence: u64) -> Self {
        Self {
            session_id,
            sequence,
        }
    }
}

impl fmt::Display for SenderDeduplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.session_id, self.sequence)
    }
}
