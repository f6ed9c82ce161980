//! Suspension, completion and removal of a flow, plus its sub-flow stack.

use super::TransitionResult;
use super::builder::TransitionBuilder;
use super::session;
use crate::action::{Action, FlowRemovalReason};
use crate::checkpoint::{FlowState, SubFlow};
use crate::event::Event;
use crate::flow::{FlowIoRequest, FrozenFlow};

/// Checkpoint the suspended continuation, then see if it can continue at once.
pub(super) fn suspend(
    mut b: TransitionBuilder,
    io_request: FlowIoRequest,
    frozen_flow: FrozenFlow,
) -> TransitionResult {
    b.state.checkpoint.flow_state = FlowState::Started {
        frozen_flow,
        pending_io: io_request,
    };
    b.state.checkpoint.number_of_suspends += 1;
    b.state.is_flow_resumed = false;
    b.commit_checkpoint();
    b.push(Action::ScheduleEvent(Event::DoRemainingWork));
    b.process_events()
}

pub(super) fn flow_finish(mut b: TransitionBuilder, return_value: Vec<u8>) -> TransitionResult {
    if b.state.checkpoint.sub_flow_stack.len() > 1 {
        let error = b.internal_error(format!(
            "Flow finished inside sub-flow {}",
            b.state.checkpoint.current_flow_name()
        ));
        return b.fresh_error(error);
    }
    b.state.is_flow_resumed = false;
    b.commit_removal();
    session::end_all_sessions(&mut b);
    remove(b, FlowRemovalReason::OrderlyFinish(return_value))
}

pub(super) fn soft_shutdown(b: TransitionBuilder) -> TransitionResult {
    remove(b, FlowRemovalReason::SoftShutdown)
}

/// Mark the flow removed and hand its final state to the manager.
pub(super) fn remove(mut b: TransitionBuilder, reason: FlowRemovalReason) -> TransitionResult {
    b.state.is_removed = true;
    let flow_id = b.state.flow_id;
    let last_state = Box::new(b.state.clone());
    b.push(Action::RemoveFlow {
        flow_id,
        reason,
        last_state,
    });
    b.abort()
}

pub(super) fn retry_from_safe_point(mut b: TransitionBuilder) -> TransitionResult {
    let current_state = Box::new(b.state.clone());
    b.push(Action::RetryFlowFromSafePoint { current_state });
    b.abort()
}

pub(super) fn enter_sub_flow(mut b: TransitionBuilder, sub_flow: SubFlow) -> TransitionResult {
    let was_timed = b.state.checkpoint.is_timed();
    b.state.checkpoint.sub_flow_stack.push(sub_flow);
    if !was_timed && b.state.checkpoint.is_timed() {
        let flow_id = b.state.flow_id;
        b.push(Action::ScheduleFlowTimeout { flow_id });
    }
    b.process_events()
}

pub(super) fn leave_sub_flow(mut b: TransitionBuilder) -> TransitionResult {
    if b.state.checkpoint.sub_flow_stack.len() <= 1 {
        let error = b.internal_error("Sub-flow stack underflow");
        return b.fresh_error(error);
    }
    let was_timed = b.state.checkpoint.is_timed();
    b.state.checkpoint.sub_flow_stack.pop();
    if was_timed && !b.state.checkpoint.is_timed() {
        let flow_id = b.state.flow_id;
        b.push(Action::CancelFlowTimeout { flow_id });
    }
    b.process_events()
}
