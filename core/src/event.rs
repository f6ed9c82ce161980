//! Events processed by a flow's transition pipeline.
//!
//! Each flow has its own mailbox of events, processed strictly one at a time
//! in arrival order. Some events come from outside (session messages,
//! timeouts, shutdown); the rest are produced by the flow itself as its logic
//! runs and suspends.

use crate::checkpoint::SubFlow;
use crate::error::FlowError;
use crate::external::DeduplicationHandle;
use crate::flow::{FlowIoRequest, FrozenFlow};
use crate::id::SessionId;
use crate::identity::Party;
use crate::session::ExistingSessionMessage;
use chrono::{DateTime, Utc};

/// Input to one transition.
#[derive(Clone, Debug)]
pub enum Event {
    /// Make whatever progress is possible without new input.
    DoRemainingWork,
    /// A message arrived on one of the flow's sessions.
    DeliverSessionMessage {
        /// The message.
        message: ExistingSessionMessage,
        /// Acknowledged once the message's effects are checkpointed.
        deduplication_handle: DeduplicationHandle,
        /// Resolved sender.
        sender: Party,
    },
    /// The flow failed, or a failure was injected (for example a timeout).
    Error(FlowError),
    /// An external event whose only effect is to be acknowledged with the
    /// flow's next checkpoint.
    GeneratedByExternalEvent(DeduplicationHandle),
    /// The node is shutting down; leave the flow for the next start.
    SoftShutdown,
    /// The Flow Hospital decided the flow should fail.
    StartErrorPropagation,
    /// The Flow Hospital decided the flow should restart from its last checkpoint.
    RetryFlowFromSafePoint,
    /// The logic entered a sub-flow.
    EnterSubFlow(SubFlow),
    /// The logic left its innermost sub-flow.
    LeaveSubFlow,
    /// The logic opened a session.
    InitiateFlow {
        /// The counterparty.
        peer: Party,
        /// Our end of the new session.
        session_id: SessionId,
    },
    /// The logic suspended.
    Suspend {
        /// What the flow waits for.
        io_request: FlowIoRequest,
        /// The continuation to checkpoint.
        frozen_flow: FrozenFlow,
    },
    /// The logic finished.
    FlowFinish {
        /// Serialized return value.
        return_value: Vec<u8>,
    },
    /// A sleep timer fired.
    WakeUpFromSleep {
        /// End of the sleep the timer was set for.
        until: DateTime<Utc>,
    },
}

impl Event {
    /// Short name for logging and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DoRemainingWork => "DoRemainingWork",
            Self::DeliverSessionMessage { .. } => "DeliverSessionMessage",
            Self::Error(_) => "Error",
            Self::GeneratedByExternalEvent(_) => "GeneratedByExternalEvent",
            Self::SoftShutdown => "SoftShutdown",
            Self::StartErrorPropagation => "StartErrorPropagation",
            Self::RetryFlowFromSafePoint => "RetryFlowFromSafePoint",
            Self::EnterSubFlow(_) => "EnterSubFlow",
            Self::LeaveSubFlow => "LeaveSubFlow",
            Self::InitiateFlow { .. } => "InitiateFlow",
            Self::Suspend { .. } => "Suspend",
            Self::FlowFinish { .. } => "FlowFinish",
            Self::WakeUpFromSleep { .. } => "WakeUpFromSleep",
        }
    }

    /// The deduplication handle of an event caused by an external delivery.
    #[must_use]
    pub const fn deduplication_handle(&self) -> Option<&DeduplicationHandle> {
        match self {
            Self::DeliverSessionMessage {
                deduplication_handle,
                ..
            }
            | Self::GeneratedByExternalEvent(deduplication_handle) => Some(deduplication_handle),
            _ => None,
        }
    }
}
