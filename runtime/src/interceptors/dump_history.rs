use crate::transition_executor::{TransitionContext, TransitionExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// One entry of a flow's transition history.
#[derive(Clone, Debug, Serialize)]
pub struct TransitionRecord {
    /// When the transition ran.
    pub timestamp: DateTime<Utc>,
    /// The event.
    pub event: &'static str,
    /// Names of the actions, in order.
    pub actions: Vec<&'static str>,
    /// The continuation, debug-formatted.
    pub continuation: String,
    /// Suspend count after the transition.
    pub number_of_suspends: u64,
    /// Errors recorded after the transition.
    pub errors: Vec<String>,
}

/// Keeps the transition history of every live flow and logs it when the flow
/// becomes errored. Meant for development: history grows with every
/// transition until the flow is removed.
pub struct DumpHistoryInterceptor {
    delegate: Box<dyn TransitionExecutor>,
    history: Mutex<HashMap<FlowId, Vec<TransitionRecord>>>,
}

impl DumpHistoryInterceptor {
    /// Wrap `delegate`.
    #[must_use]
    pub fn new(delegate: Box<dyn TransitionExecutor>) -> Self {
        Self {
            delegate,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn record(
        &self,
        previous_state: &StateMachineState,
        next_state: &StateMachineState,
        record: TransitionRecord,
    ) {
        let flow_id = next_state.flow_id;
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if next_state.is_removed {
            history.remove(&flow_id);
            return;
        }
        let records = history.entry(flow_id).or_default();
        records.push(record);

        if !previous_state.checkpoint.error_state.is_errored()
            && next_state.checkpoint.error_state.is_errored()
        {
            match serde_json::to_string_pretty(records) {
                Ok(dump) => tracing::warn!(flow_id = %flow_id, history = %dump, "Flow errored, transition history follows"),
                Err(error) => tracing::warn!(flow_id = %flow_id, %error, "Flow errored, cannot render its history"),
            }
        }
    }
}

#[async_trait]
impl TransitionExecutor for DumpHistoryInterceptor {
    fn flow_removed(&self, flow_id: FlowId) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&flow_id);
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

        let record = TransitionRecord {
            timestamp: Utc::now(),
            event: event.name(),
            actions,
            continuation: format!("{continuation:?}"),
            number_of_suspends: next_state.checkpoint.number_of_suspends,
            errors: next_state
                .checkpoint
                .error_state
                .errors()
                .iter()
                .map(ToString::to_string)
                .collect(),
        };
        self.record(previous_state, &next_state, record);
        (continuation, next_state)
    }
}
