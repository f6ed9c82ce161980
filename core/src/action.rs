//! Side effects requested by transitions.
//!
//! Transitions never touch the outside world; they return a list of actions,
//! executed in order by the runtime's action executor.

use crate::checkpoint::Checkpoint;
use crate::error::FlowError;
use crate::event::Event;
use crate::external::DeduplicationHandle;
use crate::id::{FlowId, SenderDeduplicationId, SessionId};
use crate::identity::Party;
use crate::session::{ExistingSessionMessage, InitialSessionMessage};
use crate::state::StateMachineState;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;

/// Why a flow is being removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowRemovalReason {
    /// The logic finished with this serialized return value.
    OrderlyFinish(Vec<u8>),
    /// The flow failed with these errors, oldest first.
    ErrorFinish(Vec<FlowError>),
    /// The node is shutting down; the checkpoint stays for the next start.
    SoftShutdown,
}

/// A session that is told about a failure.
///
/// Each error is sent as its own message; the `n`th error uses
/// `deduplication_id.sequence + n`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecipient {
    /// The counterparty.
    pub party: Party,
    /// The counterparty's session id.
    pub peer_session_id: SessionId,
    /// Deduplication id of the first error message.
    pub deduplication_id: SenderDeduplicationId,
}

/// One side effect.
#[derive(Clone, Debug)]
pub enum Action {
    /// Complete the future returned when the flow was started.
    SignalFlowHasStarted {
        /// The flow.
        flow_id: FlowId,
    },
    /// Send a session initiation.
    SendInitial {
        /// Recipient.
        party: Party,
        /// The message.
        message: InitialSessionMessage,
        /// Id the receiver deduplicates on.
        deduplication_id: SenderDeduplicationId,
    },
    /// Send a message on an established session.
    SendExisting {
        /// Recipient.
        party: Party,
        /// The message.
        message: ExistingSessionMessage,
        /// Id the receiver deduplicates on.
        deduplication_id: SenderDeduplicationId,
    },
    /// Write a checkpoint.
    PersistCheckpoint {
        /// The flow.
        flow_id: FlowId,
        /// The checkpoint.
        checkpoint: Box<Checkpoint>,
        /// A previous checkpoint of this flow exists.
        is_checkpoint_update: bool,
    },
    /// Delete the flow's checkpoint.
    RemoveCheckpoint {
        /// The flow.
        flow_id: FlowId,
    },
    /// Record that these deliveries were processed, inside the transaction.
    PersistDeduplicationFacts {
        /// The deliveries.
        handles: Vec<DeduplicationHandle>,
    },
    /// Acknowledge deliveries to the messaging layer, after the transaction.
    AcknowledgeMessages {
        /// The deliveries.
        handles: Vec<DeduplicationHandle>,
    },
    /// Tell counterparties the flow failed.
    PropagateErrors {
        /// Errors not yet propagated.
        errors: Vec<FlowError>,
        /// Sessions to send them on.
        recipients: Vec<ErrorRecipient>,
    },
    /// Put an event on the flow's own mailbox.
    ScheduleEvent(Event),
    /// Wake the flow at a point in time.
    SleepUntil {
        /// When to wake.
        until: DateTime<Utc>,
    },
    /// Put the flow under timeout supervision.
    ScheduleFlowTimeout {
        /// The flow.
        flow_id: FlowId,
    },
    /// Lift timeout supervision.
    CancelFlowTimeout {
        /// The flow.
        flow_id: FlowId,
    },
    /// Route a session to the flow.
    AddSessionBinding {
        /// The flow.
        flow_id: FlowId,
        /// The session.
        session_id: SessionId,
    },
    /// Stop routing sessions.
    RemoveSessionBindings {
        /// The sessions.
        session_ids: Vec<SessionId>,
    },
    /// Remove the flow from the manager.
    RemoveFlow {
        /// The flow.
        flow_id: FlowId,
        /// Why.
        reason: FlowRemovalReason,
        /// The flow's final state.
        last_state: Box<StateMachineState>,
    },
    /// Replace the flow with a fresh instance built from its last checkpoint.
    RetryFlowFromSafePoint {
        /// The flow's state when the retry was decided.
        current_state: Box<StateMachineState>,
    },
    /// Start staging persistence writes.
    CreateTransaction,
    /// Apply staged writes.
    CommitTransaction,
    /// Discard staged writes.
    RollbackTransaction,
}

impl Action {
    /// Short name for logging and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SignalFlowHasStarted { .. } => "SignalFlowHasStarted",
            Self::SendInitial { .. } => "SendInitial",
            Self::SendExisting { .. } => "SendExisting",
            Self::PersistCheckpoint { .. } => "PersistCheckpoint",
            Self::RemoveCheckpoint { .. } => "RemoveCheckpoint",
            Self::PersistDeduplicationFacts { .. } => "PersistDeduplicationFacts",
            Self::AcknowledgeMessages { .. } => "AcknowledgeMessages",
            Self::PropagateErrors { .. } => "PropagateErrors",
            Self::ScheduleEvent(_) => "ScheduleEvent",
            Self::SleepUntil { .. } => "SleepUntil",
            Self::ScheduleFlowTimeout { .. } => "ScheduleFlowTimeout",
            Self::CancelFlowTimeout { .. } => "CancelFlowTimeout",
            Self::AddSessionBinding { .. } => "AddSessionBinding",
            Self::RemoveSessionBindings { .. } => "RemoveSessionBindings",
            Self::RemoveFlow { .. } => "RemoveFlow",
            Self::RetryFlowFromSafePoint { .. } => "RetryFlowFromSafePoint",
            Self::CreateTransaction => "CreateTransaction",
            Self::CommitTransaction => "CommitTransaction",
            Self::RollbackTransaction => "RollbackTransaction",
        }
    }
}

/// Actions produced by one transition, in execution order.
pub type Actions = SmallVec<[Action; 4]>;
