//! # Flowmachine Runtime
//!
//! The Flow State Machine Manager: the supervisor that creates, schedules,
//! suspends, persists, resumes, retries and removes flows.
//!
//! ## Core Components
//!
//! - **Manager**: owns the flow registry, session router, timeout map and lifecycle
//! - **Execution units**: one task per flow, draining its mailbox one event at a time
//! - **Transition executor**: runs the actions of each transition, wrapped by interceptors
//! - **Flow Hospital**: decides whether a failing flow is retried, observed or terminated
//! - **Timeout scheduler**: per-flow watchdog timers with exponential backoff
//!
//! ## Example
//!
//! ```ignore
//! use flowmachine_runtime::{FlowStateMachineManager, StateMachineConfig, StateMachineServices};
//!
//! let manager = FlowStateMachineManager::new(
//!     StateMachineConfig::default(),
//!     Party::new("O=Bank A"),
//!     services,
//! );
//! manager.start(node_ready).await?;
//!
//! let handle = manager
//!     .start_flow(&PaymentFlow::new(peer), InvocationContext::rpc("alice"), None, None)
//!     .await?;
//! let receipt: Receipt = handle.result_as().await?;
//! ```

pub(crate) mod action_executor;
pub mod config;
pub mod event_queue;
pub(crate) mod execution;
pub mod hospital;
pub(crate) mod inner_state;
pub mod interceptors;
pub mod lifecycle;
pub mod manager;
/// Prometheus metrics for observability
pub mod metrics;
pub(crate) mod router;
pub mod timeout;
pub mod transition_executor;

/// Error types of the manager
pub mod error {
    use crate::lifecycle::LifeCycleState;
    use flowmachine_core::checkpoint::CheckpointError;
    use flowmachine_core::checkpoint_store::CheckpointStoreError;
    use flowmachine_core::id::{FlowId, SessionId};
    use flowmachine_core::messaging::MessagingError;
    use thiserror::Error;

    /// Errors of manager operations.
    ///
    /// Failures inside a single flow never surface here; they go to the
    /// Flow Hospital and end up in the flow's result.
    #[derive(Error, Debug)]
    pub enum ManagerError {
        /// The operation needs a different lifecycle stage.
        #[error("Expected lifecycle state {expected}, but was {actual}")]
        WrongLifeCycle {
            /// Required stage.
            expected: LifeCycleState,
            /// Stage at the time of the call.
            actual: LifeCycleState,
        },

        /// The manager was started outside a tokio runtime.
        #[error("The flow state machine manager needs a tokio runtime")]
        NoRuntime,

        /// A session is already routed to another flow.
        ///
        /// Session ids are random; this is a programming error, not bad luck.
        #[error("Session {session_id} is bound to {existing}, cannot bind it to {requested}")]
        ConflictingSessionBinding {
            /// The session.
            session_id: SessionId,
            /// Flow it is routed to.
            existing: FlowId,
            /// Flow that asked for it.
            requested: FlowId,
        },

        /// An orderly finish was requested for a flow that is not done.
        #[error("Cannot remove flow {flow_id}: {reason}")]
        InvalidRemoval {
            /// The flow.
            flow_id: FlowId,
            /// What is still outstanding.
            reason: String,
        },

        /// Checkpoint verification found checkpoints that cannot be restored.
        #[error("{0} checkpoints could not be restored")]
        UnrestorableCheckpoints(usize),

        /// The flow was dropped before it began executing.
        #[error("Flow {0} was not started")]
        FlowNotStarted(String),

        /// Checkpoint store failure.
        #[error(transparent)]
        Store(#[from] CheckpointStoreError),

        /// A checkpoint or flow could not be (de)serialized.
        #[error(transparent)]
        Checkpoint(#[from] CheckpointError),

        /// Messaging failure.
        #[error(transparent)]
        Messaging(#[from] MessagingError),
    }

    /// A failure while executing the actions of one transition.
    #[derive(Error, Debug)]
    pub enum ActionError {
        /// Checkpoint store failure.
        #[error(transparent)]
        Store(#[from] CheckpointStoreError),

        /// The checkpoint could not be serialized.
        #[error(transparent)]
        Checkpoint(#[from] CheckpointError),

        /// A session message could not be sent.
        #[error(transparent)]
        Messaging(#[from] MessagingError),

        /// The manager refused the action.
        #[error(transparent)]
        Manager(#[from] ManagerError),

        /// A transactional action ran outside a transaction.
        #[error("{0} outside of a transaction")]
        NoTransaction(&'static str),
    }
}

pub use config::{FlowTimeoutConfig, HospitalConfig, StateMachineConfig};
pub use error::{ActionError, ManagerError};
pub use event_queue::EventQueue;
pub use hospital::{
    AdmissionKind, Diagnosis, FlowHospital, MedicalRecord, ObservedSessionInit, Staff, Verdict,
};
pub use inner_state::{Change, FlowInfo};
pub use lifecycle::{LifeCycle, LifeCycleState};
pub use manager::{FlowStateMachineManager, StateMachineServices};
pub use metrics::{MetricsError, MetricsServer};
pub use transition_executor::{TransitionContext, TransitionExecutor};
