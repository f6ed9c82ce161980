use crate::transition_executor::{TransitionContext, TransitionExecutor};
use async_trait::async_trait;
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};

/// Logs every transition at debug level.
pub struct PrintingInterceptor {
    delegate: Box<dyn TransitionExecutor>,
}

impl PrintingInterceptor {
    /// Wrap `delegate`.
    #[must_use]
    pub fn new(delegate: Box<dyn TransitionExecutor>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl TransitionExecutor for PrintingInterceptor {
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
        let actions: Vec<&'static str> = transition.actions.iter().map(|a| a.name()).collect();
        let (continuation, next_state) = self
            .delegate
            .execute_transition(ctx, previous_state, event, transition)
            .await;
        tracing::debug!(
            flow_id = %ctx.flow_id,
            event = event.name(),
            ?actions,
            ?continuation,
            suspends = next_state.checkpoint.number_of_suspends,
            errored = next_state.checkpoint.error_state.is_errored(),
            "Transition"
        );
        (continuation, next_state)
    }
}
