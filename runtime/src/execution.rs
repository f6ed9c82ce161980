//! The execution unit of one flow.
//!
//! A flow runs as its own tokio task. The task owns the flow's
//! [`StateMachineState`] and its logic, takes events from the mailbox one at
//! a time, and for each computes the transition, executes it, and runs the
//! logic when the continuation asks for it. Nothing else ever touches the
//! state, so transitions of one flow never overlap.

use crate::event_queue::EventQueue;
use crate::manager::FlowStateMachineManager;
use crate::transition_executor::TransitionContext;
use flowmachine_core::error::FlowError;
use flowmachine_core::event::Event;
use flowmachine_core::flow::{FlowContext, FlowLogic, FlowResume, FlowStep};
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::FlowContinuation;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) struct FlowExecution {
    flow_id: FlowId,
    state: StateMachineState,
    logic: Box<dyn FlowLogic>,
    queue: Arc<EventQueue>,
    manager: FlowStateMachineManager,
    _guard: ExecutionGuard,
}

impl FlowExecution {
    pub(crate) fn new(
        state: StateMachineState,
        logic: Box<dyn FlowLogic>,
        queue: Arc<EventQueue>,
        manager: FlowStateMachineManager,
        guard: ExecutionGuard,
    ) -> Self {
        Self {
            flow_id: state.flow_id,
            state,
            logic,
            queue,
            manager,
            _guard: guard,
        }
    }

    /// Process events until the flow is removed or replaced.
    pub(crate) async fn run(mut self) {
        loop {
            let event = self.queue.recv().await;
            if !self.process_event(event).await {
                break;
            }
        }
        tracing::debug!(flow_id = %self.flow_id, "Flow execution ended");
    }

    /// Handle one mailbox event, together with the events the logic produces
    /// while running because of it. Returns false once the flow aborted.
    async fn process_event(&mut self, event: Event) -> bool {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            match self.transition(event).await {
                FlowContinuation::ProcessEvents => {}
                FlowContinuation::Resume(input) => pending.extend(self.run_logic(input)),
                FlowContinuation::Throw(error) => {
                    pending.extend(self.run_logic(FlowResume::Failed(error)));
                }
                FlowContinuation::Abort => return false,
            }
        }
        true
    }

    async fn transition(&mut self, event: Event) -> FlowContinuation {
        let shared = self.manager.shared();
        let result = shared
            .state_machine
            .transition(self.state.clone(), event.clone());
        let ctx = TransitionContext {
            flow_id: self.flow_id,
            queue: &self.queue,
            manager: &self.manager,
        };
        let (continuation, next_state) = shared
            .transition_executor
            .execute_transition(&ctx, &self.state, &event, result)
            .await;
        self.state = next_state;
        continuation
    }

    /// Run the logic to its next suspension point and turn what it did into
    /// events: first the operations it performed, then how it stopped.
    fn run_logic(&mut self, input: FlowResume) -> Vec<Event> {
        let mut ctx = FlowContext::new(self.flow_id, self.state.checkpoint.our_identity.clone());
        let step = self.logic.resume(&mut ctx, input);

        if let Some(seconds) = ctx.take_timeout_request() {
            self.manager.reset_custom_timeout(self.flow_id, seconds);
        }
        let mut events = ctx.take_events();
        events.push(match step {
            Ok(FlowStep::Suspend(io_request)) => match self.logic.freeze() {
                Ok(frozen_flow) => Event::Suspend {
                    io_request,
                    frozen_flow,
                },
                Err(error) => Event::Error(FlowError::logic(format!(
                    "Cannot checkpoint {}: {error}",
                    self.logic.flow_name()
                ))),
            },
            Ok(FlowStep::Finish(return_value)) => Event::FlowFinish { return_value },
            Err(error) => Event::Error(error),
        });
        events
    }
}

/// Counts live execution units, so `stop` can wait for them to end.
pub(crate) struct ExecutionGuard {
    executions: Arc<watch::Sender<usize>>,
}

impl ExecutionGuard {
    pub(crate) fn new(executions: &Arc<watch::Sender<usize>>) -> Self {
        executions.send_modify(|count| *count += 1);
        Self {
            executions: Arc::clone(executions),
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.executions
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
