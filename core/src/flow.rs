//! The contract between the state machine and a flow's business logic.
//!
//! Flow logic is written as an explicit continuation: the state machine calls
//! [`FlowLogic::resume`] with whatever the flow was waiting for, the logic runs
//! until it needs something from the outside world, and returns a
//! [`FlowStep::Suspend`] naming that thing. Between those calls the logic is
//! just a value, so it can be frozen into a checkpoint with
//! [`FlowLogic::freeze`] and thawed later on any worker or any node restart.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Serialize, Deserialize)]
//! enum Ping {
//!     Start { peer: Party },
//!     AwaitPong { session: SessionId },
//! }
//!
//! impl FlowLogic for Ping {
//!     fn flow_name(&self) -> &'static str { "ping" }
//!
//!     fn resume(&mut self, ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
//!         match (&*self, input) {
//!             (Ping::Start { peer }, FlowResume::Start) => {
//!                 let session = ctx.initiate_flow(peer.clone());
//!                 *self = Ping::AwaitPong { session };
//!                 Ok(FlowStep::Suspend(FlowIoRequest::SendAndReceive { session_id: session, payload: b"ping".to_vec() }))
//!             }
//!             (Ping::AwaitPong { .. }, FlowResume::Received { payload, .. }) => Ok(FlowStep::Finish(payload)),
//!             (_, FlowResume::Failed(error)) => Err(error),
//!             _ => Err(FlowError::logic("unexpected resume")),
//!         }
//!     }
//!
//!     fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
//!         FrozenFlow::freeze(self.flow_name(), self)
//!     }
//! }
//! ```

use crate::checkpoint::{CheckpointError, SubFlow};
use crate::error::FlowError;
use crate::event::Event;
use crate::id::{FlowId, SessionId};
use crate::identity::Party;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::time::Duration;

/// Serialized flow logic plus the name needed to thaw it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenFlow {
    flow_name: String,
    bytes: Vec<u8>,
}

impl FrozenFlow {
    /// Wrap already-serialized logic.
    #[must_use]
    pub fn new(flow_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            flow_name: flow_name.into(),
            bytes,
        }
    }

    /// Serialize `logic` with bincode.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the logic cannot be serialized.
    pub fn freeze<T: Serialize>(flow_name: &str, logic: &T) -> Result<Self, CheckpointError> {
        let bytes = bincode::serialize(logic)
            .map_err(|e| CheckpointError::Serialization(format!("{flow_name}: {e}")))?;
        Ok(Self::new(flow_name, bytes))
    }

    /// Deserialize the logic back into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Deserialization`] if the bytes do not decode as `T`.
    pub fn thaw<T: DeserializeOwned>(&self) -> Result<T, CheckpointError> {
        bincode::deserialize(&self.bytes)
            .map_err(|e| CheckpointError::Deserialization(format!("{}: {e}", self.flow_name)))
    }

    /// Name the logic was registered under.
    #[must_use]
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// The serialized logic.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for FrozenFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenFlow")
            .field("flow_name", &self.flow_name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// What a suspended flow is waiting for.
///
/// Stored in the checkpoint so a restored flow knows what to wait for again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowIoRequest {
    /// Send `payload` on a session and carry on.
    Send {
        /// Session to send on.
        session_id: SessionId,
        /// Application data.
        payload: Vec<u8>,
    },
    /// Wait for the next message on a session.
    Receive {
        /// Session to receive from.
        session_id: SessionId,
    },
    /// Send, then wait for the reply.
    SendAndReceive {
        /// Session to use.
        session_id: SessionId,
        /// Application data.
        payload: Vec<u8>,
    },
    /// End sessions, telling the counterparties nothing more will come.
    CloseSessions {
        /// Sessions to close.
        session_ids: Vec<SessionId>,
    },
    /// Wait until a point in time.
    Sleep {
        /// When to wake up.
        until: DateTime<Utc>,
    },
    /// Checkpoint and continue immediately.
    ForceCheckpoint,
}

impl FlowIoRequest {
    /// A sleep ending `duration` from now.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self::Sleep {
            until: Utc::now() + delta,
        }
    }

    /// Short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "Send",
            Self::Receive { .. } => "Receive",
            Self::SendAndReceive { .. } => "SendAndReceive",
            Self::CloseSessions { .. } => "CloseSessions",
            Self::Sleep { .. } => "Sleep",
            Self::ForceCheckpoint => "ForceCheckpoint",
        }
    }
}

/// What a flow is given when it resumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowResume {
    /// First run of the logic.
    Start,
    /// The requested operation completed with no result.
    Proceed,
    /// A message arrived on the session the flow was receiving from.
    Received {
        /// The session the message arrived on.
        session_id: SessionId,
        /// Application data.
        payload: Vec<u8>,
    },
    /// The requested operation failed. Logic may handle it or return it.
    Failed(FlowError),
}

/// Outcome of running flow logic up to its next suspension point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowStep {
    /// The flow needs something before it can continue.
    Suspend(FlowIoRequest),
    /// The flow finished with a serialized return value.
    Finish(Vec<u8>),
}

impl FlowStep {
    /// Finish with `value` serialized by bincode.
    ///
    /// # Errors
    ///
    /// Returns a logic error if `value` cannot be serialized.
    pub fn finish<T: Serialize>(value: &T) -> Result<Self, FlowError> {
        bincode::serialize(value)
            .map(Self::Finish)
            .map_err(|e| FlowError::logic(format!("Cannot serialize flow result: {e}")))
    }
}

/// The business logic of a flow.
pub trait FlowLogic: Send + fmt::Debug + 'static {
    /// Name the logic is registered under in the flow catalog.
    fn flow_name(&self) -> &'static str;

    /// Whether the flow runs under timeout supervision.
    fn is_timed(&self) -> bool {
        false
    }

    /// Whether starting the flow twice is harmless.
    ///
    /// Idempotent flows skip the checkpoint normally written before their
    /// first run; after a crash they are simply started again.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Run until the next suspension point.
    ///
    /// # Errors
    ///
    /// Returning an error fails the flow; the Flow Hospital decides what happens next.
    fn resume(&mut self, ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError>;

    /// Serialize the current continuation.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the logic cannot be serialized.
    fn freeze(&self) -> Result<FrozenFlow, CheckpointError>;
}

/// Operations flow logic can perform without suspending.
///
/// Each one is recorded as an [`Event`] and fed through the transition
/// pipeline before the suspension the logic returns.
#[derive(Debug)]
pub struct FlowContext {
    flow_id: FlowId,
    our_identity: Party,
    events: Vec<Event>,
    timeout_request: Option<u64>,
}

impl FlowContext {
    /// Create a context for one run of a flow's logic.
    #[must_use]
    pub const fn new(flow_id: FlowId, our_identity: Party) -> Self {
        Self {
            flow_id,
            our_identity,
            events: Vec::new(),
            timeout_request: None,
        }
    }

    /// The running flow's id.
    #[must_use]
    pub const fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Identity the flow acts as.
    #[must_use]
    pub const fn our_identity(&self) -> &Party {
        &self.our_identity
    }

    /// Open a session to `peer`. Nothing is sent until the first send or receive.
    pub fn initiate_flow(&mut self, peer: Party) -> SessionId {
        let session_id = SessionId::random();
        self.events.push(Event::InitiateFlow { peer, session_id });
        session_id
    }

    /// Push a sub-flow marker. A timed sub-flow puts the flow under timeout supervision.
    pub fn enter_sub_flow(&mut self, flow_name: impl Into<String>, is_timed: bool) {
        self.events.push(Event::EnterSubFlow(SubFlow::new(flow_name, is_timed)));
    }

    /// Pop the innermost sub-flow marker.
    pub fn leave_sub_flow(&mut self) {
        self.events.push(Event::LeaveSubFlow);
    }

    /// Ask for a longer timeout than the configured one, in seconds.
    pub fn request_timeout(&mut self, seconds: u64) {
        self.timeout_request = Some(seconds);
    }

    /// Events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Timeout requested since the last call.
    pub fn take_timeout_request(&mut self) -> Option<u64> {
        self.timeout_request.take()
    }
}
