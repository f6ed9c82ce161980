//! Session messages exchanged between flows on different nodes.
//!
//! A conversation starts with an [`InitialSessionMessage`] from the initiating
//! side, which the receiving node answers by starting a responder flow and
//! replying with `Confirm`. Everything after that is an
//! [`ExistingSessionMessage`] addressed to the recipient's own session id.
//!
//! ```text
//!   initiator                                   responder
//!      | Initial { initiator_session_id = A }        |
//!      |-------------------------------------------->|  start responder, bind B
//!      |        Existing { recipient = A, Confirm B } |
//!      |<--------------------------------------------|
//!      | Existing { recipient = B, Data }             |
//!      |-------------------------------------------->|
//!      |             Existing { recipient = A, End }  |
//!      |<--------------------------------------------|
//! ```

use crate::error::FlowError;
use crate::id::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error encoding or decoding a session message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionCodecError {
    /// The message could not be encoded.
    #[error("Failed to encode session message: {0}")]
    Encode(String),

    /// The bytes are not a valid session message.
    #[error("Failed to decode session message: {0}")]
    Decode(String),
}

/// Version information a flow advertises to its counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Version of the flow's wire protocol.
    pub flow_version: u32,
    /// Application the flow belongs to.
    pub app_name: String,
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self {
            flow_version: 1,
            app_name: String::from("flowmachine"),
        }
    }
}

/// First message of a session. Asks the receiving node to start a responder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSessionMessage {
    /// The initiator's session id. Replies are addressed to it.
    pub initiator_session_id: SessionId,
    /// Name of the initiating flow, used to find the responder.
    pub initiator_flow_name: String,
    /// The initiator's protocol version.
    pub protocol: ProtocolInfo,
    /// Payload sent together with the initiation, if any.
    pub first_payload: Option<Vec<u8>>,
}

/// Payload of a message on an established session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistingSessionPayload {
    /// The responder has started and owns `initiated_session_id`.
    Confirm {
        /// The responder's session id.
        initiated_session_id: SessionId,
        /// The responder's protocol version.
        protocol: ProtocolInfo,
    },
    /// Application data.
    Data(Vec<u8>),
    /// The sender's flow failed.
    Error(FlowError),
    /// The responder could not be started.
    Reject {
        /// Why the session was refused.
        message: String,
        /// Correlation id of the refusal.
        error_id: u64,
    },
    /// The sender will not send anything further on this session.
    End,
}

impl ExistingSessionPayload {
    /// Whether this payload closes the session.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

/// A message on an established session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingSessionMessage {
    /// The recipient's own session id.
    pub recipient_session_id: SessionId,
    /// Message content.
    pub payload: ExistingSessionPayload,
}

/// Any session message as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Session initiation.
    Initial(InitialSessionMessage),
    /// Message on an existing session.
    Existing(ExistingSessionMessage),
}

impl SessionMessage {
    /// Encode the message using bincode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionCodecError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionCodecError> {
        bincode::serialize(self).map_err(|e| SessionCodecError::Encode(e.to_string()))
    }

    /// Decode a message produced by [`SessionMessage::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionCodecError::Decode`] if the bytes are not a session message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionCodecError> {
        bincode::deserialize(bytes).map_err(|e| SessionCodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn existing_message_survives_the_wire() {
        let message = SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: SessionId::new(42),
            payload: ExistingSessionPayload::Data(b"hello".to_vec()),
        });
        let bytes = message.to_bytes().unwrap();
        assert_eq!(SessionMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result = SessionMessage::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(SessionCodecError::Decode(_))));
    }

    #[test]
    fn only_end_closes_a_session() {
        assert!(ExistingSessionPayload::End.is_end());
        assert!(!ExistingSessionPayload::Data(vec![]).is_end());
    }
}
