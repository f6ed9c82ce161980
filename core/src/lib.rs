//! # Flowmachine Core
//!
//! Types and the pure transition function of the flow state machine.
//!
//! A *flow* is a long-running, checkpointed business process that talks to
//! flows on other nodes through sessions. This crate holds everything about a
//! flow that does not need a runtime:
//!
//! - **Identity**: [`FlowId`], [`SessionId`] and deduplication ids
//! - **Flow contract**: [`FlowLogic`], written as an explicit continuation
//! - **Checkpoint**: the durable snapshot, and the [`CheckpointStore`] seam
//! - **Session protocol**: the wire messages between flows
//! - **Transition**: [`StateMachine::transition`], `(state, event) → (state, actions)`
//!
//! The runtime crate executes the actions, runs the interceptors and the
//! Flow Hospital, and owns the flows.
//!
//! ## Architecture Principles
//!
//! - Functional core: transitions never perform I/O
//! - Every side effect is an explicit [`Action`]
//! - Persistence and messaging are injected through traits

pub use chrono::{DateTime, Utc};

pub mod action;
pub mod catalog;
pub mod checkpoint;
pub mod checkpoint_store;
pub mod context;
pub mod error;
pub mod event;
pub mod external;
pub mod flow;
pub mod id;
pub mod identity;
pub mod messaging;
pub mod session;
pub mod state;
pub mod transition;

pub use action::{Action, Actions, ErrorRecipient, FlowRemovalReason};
pub use catalog::{FlowCatalog, InitiatedFlowFactory, SessionRejectError};
pub use checkpoint::{
    Checkpoint, CheckpointError, ErrorState, FlowStart, FlowState, SerializedCheckpoint,
    SessionEntry, SessionState, SubFlow,
};
pub use checkpoint_store::{CheckpointStore, CheckpointStoreError};
pub use context::{Clock, InvocationContext, InvocationOrigin, SystemClock};
pub use error::{FlowError, FlowErrorKind};
pub use event::Event;
pub use external::{
    DeduplicationHandle, DeduplicationHandler, ExternalEvent, ExternalMessageEvent,
    ExternalStartFlowEvent, FlowHandle, FlowResult, ReceivedMessage,
};
pub use flow::{FlowContext, FlowIoRequest, FlowLogic, FlowResume, FlowStep, FrozenFlow};
pub use id::{DeduplicationId, FlowId, ParseIdError, SenderDeduplicationId, SessionId};
pub use identity::{NetworkMapCache, Party};
pub use messaging::{ExternalEventSink, FlowMessaging, MessagingError};
pub use session::{
    ExistingSessionMessage, ExistingSessionPayload, InitialSessionMessage, ProtocolInfo,
    SessionCodecError, SessionMessage,
};
pub use state::StateMachineState;
pub use transition::{FlowContinuation, StateMachine, TransitionResult};
