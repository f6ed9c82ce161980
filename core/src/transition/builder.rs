//! Accumulates the new state and actions of one transition.

use super::{FlowContinuation, TransitionResult};
use crate::action::{Action, Actions};
use crate::error::{FlowError, FlowErrorKind};
use crate::flow::FlowResume;
use crate::state::StateMachineState;

pub(crate) struct TransitionBuilder {
    pub(crate) state: StateMachineState,
    pub(crate) actions: Actions,
}

impl TransitionBuilder {
    pub(crate) fn new(state: StateMachineState) -> Self {
        Self {
            state,
            actions: Actions::new(),
        }
    }

    pub(crate) fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Error id for failures raised inside a transition.
    ///
    /// Derived from the flow id and suspend count so a retried flow hitting
    /// the same failure at the same point reports the same id.
    pub(crate) const fn internal_error_id(&self) -> u64 {
        self.state.flow_id.low_bits() ^ self.state.checkpoint.number_of_suspends
    }

    pub(crate) fn internal_error(&self, message: impl Into<String>) -> FlowError {
        FlowError::with_id(FlowErrorKind::Logic, message, self.internal_error_id())
    }

    /// Persist the checkpoint and acknowledge pending deliveries in one transaction.
    pub(crate) fn commit_checkpoint(&mut self) {
        let pending = std::mem::take(&mut self.state.pending_deduplication_handlers);
        self.push(Action::CreateTransaction);
        self.push(Action::PersistCheckpoint {
            flow_id: self.state.flow_id,
            checkpoint: Box::new(self.state.checkpoint.clone()),
            is_checkpoint_update: self.state.is_any_checkpoint_persisted,
        });
        self.finish_transaction(pending);
        self.state.is_any_checkpoint_persisted = true;
    }

    /// Delete the checkpoint, if there is one, and acknowledge pending deliveries.
    pub(crate) fn commit_removal(&mut self) {
        let pending = std::mem::take(&mut self.state.pending_deduplication_handlers);
        self.push(Action::CreateTransaction);
        if self.state.is_any_checkpoint_persisted {
            self.push(Action::RemoveCheckpoint {
                flow_id: self.state.flow_id,
            });
        }
        self.finish_transaction(pending);
    }

    fn finish_transaction(&mut self, pending: Vec<crate::external::DeduplicationHandle>) {
        if pending.is_empty() {
            self.push(Action::CommitTransaction);
            return;
        }
        self.push(Action::PersistDeduplicationFacts {
            handles: pending.clone(),
        });
        self.push(Action::CommitTransaction);
        self.push(Action::AcknowledgeMessages { handles: pending });
    }

    pub(crate) fn process_events(self) -> TransitionResult {
        self.finish(FlowContinuation::ProcessEvents)
    }

    pub(crate) fn resume(mut self, input: FlowResume) -> TransitionResult {
        self.state.is_flow_resumed = true;
        self.finish(FlowContinuation::Resume(input))
    }

    pub(crate) fn throw(mut self, error: FlowError) -> TransitionResult {
        self.state.is_flow_resumed = true;
        self.finish(FlowContinuation::Throw(error))
    }

    pub(crate) fn abort(self) -> TransitionResult {
        self.finish(FlowContinuation::Abort)
    }

    /// Record `error` against the flow and discard the running transaction.
    pub(crate) fn fresh_error(mut self, error: FlowError) -> TransitionResult {
        let error_state = std::mem::take(&mut self.state.checkpoint.error_state);
        self.state.checkpoint.error_state = error_state.with_error(error);
        self.state.is_flow_resumed = false;
        self.push(Action::RollbackTransaction);
        self.process_events()
    }

    fn finish(self, continuation: FlowContinuation) -> TransitionResult {
        TransitionResult {
            new_state: self.state,
            actions: self.actions,
            continuation,
        }
    }
}
