//! The messaging layer as seen by the state machine.

use crate::external::ExternalEvent;
use crate::id::SenderDeduplicationId;
use crate::identity::Party;
use crate::session::SessionMessage;
use std::sync::Arc;
use thiserror::Error;

/// Errors sending session messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// The message could not be encoded.
    #[error("Failed to encode session message: {0}")]
    Encode(String),

    /// The transport refused the message.
    #[error("Failed to send to {party}: {reason}")]
    SendFailed {
        /// Intended recipient.
        party: String,
        /// Transport error.
        reason: String,
    },
}

/// Callback the messaging layer hands inbound events to.
pub type ExternalEventSink = Arc<dyn Fn(ExternalEvent) + Send + Sync>;

/// Peer-to-peer transport for session messages.
pub trait FlowMessaging: Send + Sync {
    /// Begin delivering inbound events to `sink`.
    fn start(&self, sink: ExternalEventSink);

    /// Queue a session message for delivery. Does not wait for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError`] if the message cannot be queued.
    fn send_session_message(
        &self,
        party: &Party,
        message: SessionMessage,
        deduplication_id: SenderDeduplicationId,
    ) -> Result<(), MessagingError>;
}
