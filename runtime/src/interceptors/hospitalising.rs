use crate::hospital::{FlowHospital, Verdict};
use crate::transition_executor::{TransitionContext, TransitionExecutor};
use async_trait::async_trait;
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};
use std::sync::Arc;

/// Admits flows to the Flow Hospital when they become errored, and carries
/// out the verdict by scheduling the matching event on the flow.
///
/// A flow that is already errored is not admitted again; it waits for the
/// verdict of its first admission.
pub struct HospitalisingInterceptor {
    delegate: Box<dyn TransitionExecutor>,
    hospital: Arc<FlowHospital>,
}

impl HospitalisingInterceptor {
    /// Wrap `delegate`.
    #[must_use]
    pub fn new(delegate: Box<dyn TransitionExecutor>, hospital: Arc<FlowHospital>) -> Self {
        Self { delegate, hospital }
    }
}

#[async_trait]
impl TransitionExecutor for HospitalisingInterceptor {
    fn flow_removed(&self, flow_id: FlowId) {
        self.delegate.flow_removed(flow_id);
    }

    async fn execute_transition(
        &self,
        ctx: &TransitionContext<'_>,
        previous_state: &StateMachineState,
        event: &Event,
        transition: TransitionResult,
    ) -> (FlowContinuation, StateMachineState) {
        let (continuation, next_state) = self
            .delegate
            .execute_transition(ctx, previous_state, event, transition)
            .await;

        let newly_errored = !previous_state.checkpoint.error_state.is_errored()
            && next_state.checkpoint.error_state.is_errored();
        if newly_errored && !next_state.is_removed {
            match self.hospital.flow_errored(&next_state) {
                Verdict::Retry => ctx.schedule_event(Event::RetryFlowFromSafePoint),
                Verdict::Terminate => ctx.schedule_event(Event::StartErrorPropagation),
                Verdict::Observe => {}
            }
        }
        if next_state.is_removed {
            self.hospital.flow_removed(next_state.flow_id);
        }
        (continuation, next_state)
    }
}
