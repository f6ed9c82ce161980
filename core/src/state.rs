//! In-memory state of a running flow.

use crate::checkpoint::Checkpoint;
use crate::external::DeduplicationHandle;
use crate::id::FlowId;

/// A flow's checkpoint plus the transient flags that are never persisted.
///
/// Owned by the flow's execution unit; nothing else mutates it.
#[derive(Clone, Debug)]
pub struct StateMachineState {
    /// The flow this state belongs to.
    pub flow_id: FlowId,
    /// Latest checkpoint, persisted or not.
    pub checkpoint: Checkpoint,
    /// Inbound deliveries not yet acknowledged, oldest first.
    pub pending_deduplication_handlers: Vec<DeduplicationHandle>,
    /// The logic is running and has not suspended since.
    pub is_flow_resumed: bool,
    /// A transaction is waiting to be notarised for this flow.
    pub is_transaction_tracked: bool,
    /// At least one checkpoint of this flow is in the store.
    pub is_any_checkpoint_persisted: bool,
    /// Starting the flow twice is harmless, so its start need not be checkpointed.
    pub is_start_idempotent: bool,
    /// The flow was removed; no further transitions apply.
    pub is_removed: bool,
}

impl StateMachineState {
    /// State of a flow that was just created.
    #[must_use]
    pub const fn new(
        flow_id: FlowId,
        checkpoint: Checkpoint,
        pending_deduplication_handlers: Vec<DeduplicationHandle>,
        is_start_idempotent: bool,
    ) -> Self {
        Self {
            flow_id,
            checkpoint,
            pending_deduplication_handlers,
            is_flow_resumed: false,
            is_transaction_tracked: false,
            is_any_checkpoint_persisted: false,
            is_start_idempotent,
            is_removed: false,
        }
    }

    /// State of a flow rebuilt from a stored checkpoint.
    #[must_use]
    pub const fn restored(flow_id: FlowId, checkpoint: Checkpoint) -> Self {
        Self {
            flow_id,
            checkpoint,
            pending_deduplication_handlers: Vec::new(),
            is_flow_resumed: false,
            is_transaction_tracked: false,
            is_any_checkpoint_persisted: true,
            is_start_idempotent: false,
            is_removed: false,
        }
    }
}
