//! Errors raised inside flows.
//!
//! A [`FlowError`] is data, not just a Rust error: it is stored in the
//! checkpoint's error state, sent to counterparties when a flow fails, and
//! handed back to whoever waits on the flow's result. It therefore has to be
//! serializable and cloneable, and carries a random id so the same failure can
//! be correlated across nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broad classification of a flow failure.
///
/// The Flow Hospital decides what to do with a failing flow based mostly on
/// this kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowErrorKind {
    /// Raised by the flow's own logic.
    Logic,
    /// The flow made no progress within its timeout.
    Timeout,
    /// A failure that is expected to go away on retry.
    Transient,
    /// A counterparty ended the session while we were waiting on it.
    SessionEnded,
    /// A counterparty refused to start the responding flow.
    SessionRejected,
    /// A counterparty's flow failed and propagated its error to us.
    Counterparty,
    /// Persistence or messaging failed while executing the flow's actions.
    Infrastructure,
    /// The node shut down before the flow completed.
    Shutdown,
    /// An operator killed the flow.
    Killed,
}

impl FlowErrorKind {
    /// Stable lowercase name, used as a metrics label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::SessionEnded => "session_ended",
            Self::SessionRejected => "session_rejected",
            Self::Counterparty => "counterparty",
            Self::Infrastructure => "infrastructure",
            Self::Shutdown => "shutdown",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure recorded against a flow.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error {error_id:016x}: {message}")]
pub struct FlowError {
    error_id: u64,
    kind: FlowErrorKind,
    message: String,
}

impl FlowError {
    /// Create an error with a fresh random id.
    #[must_use]
    pub fn new(kind: FlowErrorKind, message: impl Into<String>) -> Self {
        Self::with_id(kind, message, rand::random())
    }

    /// Create an error with a known id, for errors whose id must be
    /// reproducible (received from a peer, or raised inside a transition).
    #[must_use]
    pub fn with_id(kind: FlowErrorKind, message: impl Into<String>, error_id: u64) -> Self {
        Self {
            error_id,
            kind,
            message: message.into(),
        }
    }

    /// Error raised by flow logic.
    #[must_use]
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(FlowErrorKind::Logic, message)
    }

    /// Error injected by the timeout scheduler.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(
            FlowErrorKind::Timeout,
            "Flow did not make progress within its timeout",
        )
    }

    /// A failure that should go away on retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FlowErrorKind::Transient, message)
    }

    /// Persistence or messaging failure.
    #[must_use]
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(FlowErrorKind::Infrastructure, message)
    }

    /// The flow was killed.
    #[must_use]
    pub fn killed() -> Self {
        Self::new(FlowErrorKind::Killed, "Flow was killed")
    }

    /// Correlation id of this error.
    #[must_use]
    pub const fn error_id(&self) -> u64 {
        self.error_id
    }

    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> FlowErrorKind {
        self.kind
    }

    /// Human readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The same failure as seen by the other side of a session.
    #[must_use]
    pub fn as_counterparty_error(&self) -> Self {
        Self::with_id(FlowErrorKind::Counterparty, self.message.clone(), self.error_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_id_and_message() {
        let error = FlowError::with_id(FlowErrorKind::Logic, "boom", 0xab);
        assert_eq!(error.to_string(), "logic error 00000000000000ab: boom");
    }

    #[test]
    fn counterparty_error_keeps_the_id() {
        let error = FlowError::logic("boom");
        let remote = error.as_counterparty_error();
        assert_eq!(remote.error_id(), error.error_id());
        assert_eq!(remote.kind(), FlowErrorKind::Counterparty);
        assert_eq!(remote.message(), "boom");
    }

    #[test]
    fn timeout_errors_have_timeout_kind() {
        assert_eq!(FlowError::timeout().kind(), FlowErrorKind::Timeout);
    }
}
