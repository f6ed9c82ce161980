//! The flow state machine: a pure function from state and event to new state
//! and actions.
//!
//! [`StateMachine::transition`] never performs I/O. Everything it wants done
//! is returned as [`Action`](crate::action::Action)s for the runtime to
//! execute, plus a [`FlowContinuation`] telling the flow's execution unit what
//! to do next. Keeping it pure is what makes the transition pipeline
//! interceptable and the rules testable without a runtime.
//!
//! Rules that hold for every transition:
//!
//! - a removed flow ignores all events;
//! - an errored flow ignores events produced by its own logic, and only
//!   progresses when the Flow Hospital retries it or starts error propagation;
//! - inbound deliveries are acknowledged only in the same transaction as the
//!   checkpoint that records their effects, or when the flow is removed.

mod builder;
mod error_flow;
mod lifecycle;
mod remaining_work;
mod session;

use crate::action::Actions;
use crate::error::FlowError;
use crate::event::Event;
use crate::flow::FlowResume;
use crate::state::StateMachineState;
use builder::TransitionBuilder;

/// What the flow's execution unit does after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowContinuation {
    /// Wait for the next event.
    ProcessEvents,
    /// Run the logic with this input.
    Resume(FlowResume),
    /// Run the logic, handing it this error.
    Throw(FlowError),
    /// Stop the execution unit. The flow was removed or replaced.
    Abort,
}

/// Outcome of one transition.
#[derive(Clone, Debug)]
pub struct TransitionResult {
    /// The state after the event.
    pub new_state: StateMachineState,
    /// Side effects, in execution order.
    pub actions: Actions,
    /// What happens next.
    pub continuation: FlowContinuation,
}

/// The transition function.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateMachine;

impl StateMachine {
    /// Create the state machine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Compute the effect of `event` on `state`.
    #[must_use]
    pub fn transition(&self, state: StateMachineState, event: Event) -> TransitionResult {
        let mut b = TransitionBuilder::new(state);
        if b.state.is_removed {
            return b.abort();
        }
        let errored = b.state.checkpoint.error_state.is_errored();

        match event {
            Event::DoRemainingWork if errored => error_flow::do_remaining_work(b),
            Event::DoRemainingWork => remaining_work::do_remaining_work(b),
            Event::DeliverSessionMessage {
                message,
                deduplication_handle,
                sender,
            } => session::deliver_session_message(b, message, deduplication_handle, &sender),
            Event::GeneratedByExternalEvent(handle) => {
                b.state.pending_deduplication_handlers.push(handle);
                b.process_events()
            }
            Event::Error(error) => b.fresh_error(error),
            Event::StartErrorPropagation => error_flow::start_error_propagation(b),
            Event::RetryFlowFromSafePoint => lifecycle::retry_from_safe_point(b),
            Event::SoftShutdown => lifecycle::soft_shutdown(b),
            Event::EnterSubFlow(_)
            | Event::LeaveSubFlow
            | Event::InitiateFlow { .. }
            | Event::Suspend { .. }
            | Event::FlowFinish { .. }
            | Event::WakeUpFromSleep { .. }
                if errored =>
            {
                b.process_events()
            }
            Event::EnterSubFlow(sub_flow) => lifecycle::enter_sub_flow(b, sub_flow),
            Event::LeaveSubFlow => lifecycle::leave_sub_flow(b),
            Event::InitiateFlow { peer, session_id } => session::initiate_flow(b, peer, session_id),
            Event::Suspend {
                io_request,
                frozen_flow,
            } => lifecycle::suspend(b, io_request, frozen_flow),
            Event::FlowFinish { return_value } => lifecycle::flow_finish(b, return_value),
            Event::WakeUpFromSleep { until } => remaining_work::wake_up_from_sleep(b, until),
        }
    }
}
