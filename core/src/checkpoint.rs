//! Checkpoints: the durable snapshot of a flow.
//!
//! A checkpoint is written at every suspension point before any side effect
//! that depends on it, so a crash replays the flow from the last suspension
//! instead of repeating externally visible work. It holds everything needed to
//! rebuild the flow: who started it, its frozen logic, its open sessions, its
//! sub-flow stack and any errors recorded against it.
//!
//! Checkpoints are serialized with bincode. The format is an implementation
//! detail of this crate; stores treat [`SerializedCheckpoint`] as opaque bytes.

use crate::context::InvocationContext;
use crate::error::FlowError;
use crate::flow::{FlowIoRequest, FrozenFlow};
use crate::id::SessionId;
use crate::identity::Party;
use crate::session::ProtocolInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Errors producing or reading checkpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// A checkpoint or flow could not be serialized.
    #[error("Failed to serialize checkpoint: {0}")]
    Serialization(String),

    /// Stored bytes could not be turned back into a checkpoint or flow.
    #[error("Failed to deserialize checkpoint: {0}")]
    Deserialization(String),

    /// The checkpoint names a flow that is not in the catalog.
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),
}

/// How a flow came to be started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStart {
    /// Started locally, through the API or by a service.
    Explicit,
    /// Started as the responder to a peer's session initiation.
    Initiated {
        /// The initiating party.
        peer: Party,
        /// The initiator's session id, where our replies go.
        initiator_session_id: SessionId,
        /// Our session id, generated when the initiation arrived.
        initiated_session_id: SessionId,
        /// Name of the initiating flow.
        initiator_flow_name: String,
        /// Payload that came with the initiation.
        first_payload: Option<Vec<u8>>,
        /// Our protocol version, reported back in the confirmation.
        protocol: ProtocolInfo,
    },
}

/// Execution state of a flow. Exactly one variant is active.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// The logic has not run yet. Restoring replays it from the beginning.
    Unstarted {
        /// Why the flow was started.
        flow_start: FlowStart,
        /// The initial logic.
        frozen_flow: FrozenFlow,
    },
    /// The logic is suspended. Restoring resumes it mid-execution.
    Started {
        /// The suspended continuation.
        frozen_flow: FrozenFlow,
        /// What the flow is waiting for.
        pending_io: FlowIoRequest,
    },
}

impl FlowState {
    /// The frozen logic of either variant.
    #[must_use]
    pub const fn frozen_flow(&self) -> &FrozenFlow {
        match self {
            Self::Unstarted { frozen_flow, .. } | Self::Started { frozen_flow, .. } => frozen_flow,
        }
    }
}

/// Progress of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Opened locally, nothing sent yet.
    Uninitiated,
    /// Initiation sent, waiting for the counterparty to confirm.
    Initiating {
        /// Payloads sent before the confirmation arrived.
        buffered_sends: Vec<Vec<u8>>,
        /// Set if the counterparty refused the session.
        rejection: Option<FlowError>,
    },
    /// Both sides know each other's session id.
    Initiated {
        /// The counterparty's session id.
        peer_session_id: SessionId,
        /// Messages received but not yet consumed by the logic.
        received: VecDeque<Vec<u8>>,
        /// The counterparty closed the session.
        ended: bool,
        /// The counterparty's flow failed.
        error: Option<FlowError>,
    },
}

/// A session together with its counterparty and outbound sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// The counterparty.
    pub peer: Party,
    /// Session progress.
    pub state: SessionState,
    /// Number of messages sent so far, the next sequence number.
    pub sent_count: u64,
}

impl SessionEntry {
    /// A session opened locally.
    #[must_use]
    pub const fn uninitiated(peer: Party) -> Self {
        Self {
            peer,
            state: SessionState::Uninitiated,
            sent_count: 0,
        }
    }
}

/// Marker for one level of nested sub-flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFlow {
    /// Name of the sub-flow, used as the initiator name for sessions it opens.
    pub flow_name: String,
    /// Whether the sub-flow runs under timeout supervision.
    pub is_timed: bool,
}

impl SubFlow {
    /// Create a sub-flow marker.
    #[must_use]
    pub fn new(flow_name: impl Into<String>, is_timed: bool) -> Self {
        Self {
            flow_name: flow_name.into(),
            is_timed,
        }
    }
}

/// Errors recorded against a flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
    /// No errors.
    #[default]
    Clean,
    /// At least one error was recorded.
    Errored {
        /// Errors in the order they happened.
        errors: Vec<FlowError>,
        /// Errors before this index were already sent to counterparties.
        propagated_index: usize,
        /// The Hospital decided the flow should fail; errors are being propagated.
        propagating: bool,
    },
}

impl ErrorState {
    /// Whether any error was recorded.
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self, Self::Errored { .. })
    }

    /// Recorded errors, oldest first.
    #[must_use]
    pub fn errors(&self) -> &[FlowError] {
        match self {
            Self::Clean => &[],
            Self::Errored { errors, .. } => errors,
        }
    }

    /// This state with `error` appended.
    #[must_use]
    pub fn with_error(self, error: FlowError) -> Self {
        match self {
            Self::Clean => Self::Errored {
                errors: vec![error],
                propagated_index: 0,
                propagating: false,
            },
            Self::Errored {
                mut errors,
                propagated_index,
                propagating,
            } => {
                errors.push(error);
                Self::Errored {
                    errors,
                    propagated_index,
                    propagating,
                }
            }
        }
    }
}

/// Durable snapshot of a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Who started the flow and when.
    pub invocation_context: InvocationContext,
    /// Identity the flow acts as.
    pub our_identity: Party,
    /// Execution state.
    pub flow_state: FlowState,
    /// Open sessions.
    pub sessions: BTreeMap<SessionId, SessionEntry>,
    /// Nested sub-flows, the root flow first. Never empty while the flow runs.
    pub sub_flow_stack: Vec<SubFlow>,
    /// Errors recorded against the flow.
    pub error_state: ErrorState,
    /// How many times the flow has suspended. Never decreases.
    pub number_of_suspends: u64,
}

impl Checkpoint {
    /// The checkpoint of a flow that has not run yet.
    #[must_use]
    pub fn create(
        invocation_context: InvocationContext,
        flow_start: FlowStart,
        frozen_flow: FrozenFlow,
        our_identity: Party,
        is_timed: bool,
    ) -> Self {
        let root = SubFlow::new(frozen_flow.flow_name(), is_timed);
        Self {
            invocation_context,
            our_identity,
            flow_state: FlowState::Unstarted {
                flow_start,
                frozen_flow,
            },
            sessions: BTreeMap::new(),
            sub_flow_stack: vec![root],
            error_state: ErrorState::Clean,
            number_of_suspends: 0,
        }
    }

    /// Serialize with bincode.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if encoding fails.
    pub fn serialize(&self) -> Result<SerializedCheckpoint, CheckpointError> {
        bincode::serialize(self)
            .map(SerializedCheckpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Every session id that routes to this flow.
    ///
    /// Includes the responder's own session id of an initiated flow that has
    /// not started yet, whose session entry only appears once it runs.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        if let FlowState::Unstarted {
            flow_start:
                FlowStart::Initiated {
                    initiated_session_id,
                    ..
                },
            ..
        } = &self.flow_state
        {
            if !self.sessions.contains_key(initiated_session_id) {
                ids.push(*initiated_session_id);
            }
        }
        ids
    }

    /// Whether any active sub-flow asks for timeout supervision.
    #[must_use]
    pub fn is_timed(&self) -> bool {
        self.sub_flow_stack.iter().any(|s| s.is_timed)
    }

    /// Name of the root flow.
    #[must_use]
    pub fn flow_name(&self) -> &str {
        self.flow_state.frozen_flow().flow_name()
    }

    /// Name of the innermost sub-flow, which is the initiator of sessions it opens.
    #[must_use]
    pub fn current_flow_name(&self) -> &str {
        self.sub_flow_stack
            .last()
            .map_or_else(|| self.flow_name(), |s| s.flow_name.as_str())
    }
}

/// Bytes of a serialized [`Checkpoint`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedCheckpoint(Vec<u8>);

impl SerializedCheckpoint {
    /// Wrap bytes read from a store.
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Deserialization`] if the bytes are not a checkpoint.
    pub fn deserialize(&self) -> Result<Checkpoint, CheckpointError> {
        bincode::deserialize(&self.0).map_err(|e| CheckpointError::Deserialization(e.to_string()))
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the raw bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}
