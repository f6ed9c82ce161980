use crate::metrics::TransitionMetrics;
use crate::transition_executor::{TransitionContext, TransitionExecutor};
use async_trait::async_trait;
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};
use std::time::Instant;

/// Counts and times transitions.
pub struct MetricInterceptor {
    delegate: Box<dyn TransitionExecutor>,
}

impl MetricInterceptor {
    /// Wrap `delegate`.
    #[must_use]
    pub fn new(delegate: Box<dyn TransitionExecutor>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl TransitionExecutor for MetricInterceptor {
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
        let start = Instant::now();
        let outcome = self
            .delegate
            .execute_transition(ctx, previous_state, event, transition)
            .await;
        TransitionMetrics::record_transition(event.name(), start.elapsed());
        outcome
    }
}
