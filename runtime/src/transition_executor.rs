//! Executes transitions: runs their actions and hands back what the flow
//! does next.
//!
//! The executor is a decorator chain. [`TransitionExecutorImpl`] runs the
//! actions; interceptors wrap it to observe or redirect the outcome without
//! touching the pure transition itself. [`build_transition_executor`]
//! assembles the chain once, from configuration:
//!
//! ```text
//! Hospitalising → Metric → DumpHistory? → DeserializationCheck? → Printing? → Impl
//! ```

use crate::action_executor::ActionExecutor;
use crate::config::StateMachineConfig;
use crate::event_queue::EventQueue;
use crate::hospital::FlowHospital;
use crate::interceptors::{
    CheckpointChecker, DeserializationCheckInterceptor, DumpHistoryInterceptor,
    HospitalisingInterceptor, MetricInterceptor, PrintingInterceptor,
};
use crate::manager::FlowStateMachineManager;
use crate::metrics::TransitionMetrics;
use async_trait::async_trait;
use flowmachine_core::error::FlowError;
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};
use std::sync::Arc;

/// Where a transition runs: the flow and its mailbox.
pub struct TransitionContext<'a> {
    /// The flow being transitioned.
    pub flow_id: FlowId,
    pub(crate) queue: &'a Arc<EventQueue>,
    pub(crate) manager: &'a FlowStateMachineManager,
}

impl TransitionContext<'_> {
    /// Append an event to the flow's own mailbox.
    pub fn schedule_event(&self, event: Event) {
        self.queue.push(event);
    }
}

/// Executes a computed transition.
#[async_trait]
pub trait TransitionExecutor: Send + Sync {
    /// Run `transition`, computed from `previous_state` and `event`.
    ///
    /// Returns the continuation and the state the flow moves to. On failure
    /// the state is `previous_state` with the failure recorded, so nothing
    /// of the failed transition leaks.
    async fn execute_transition(
        &self,
        ctx: &TransitionContext<'_>,
        previous_state: &StateMachineState,
        event: &Event,
        transition: TransitionResult,
    ) -> (FlowContinuation, StateMachineState);

    /// The flow left the registry; forget anything kept about it.
    fn flow_removed(&self, _flow_id: FlowId) {}
}

/// The innermost executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransitionExecutorImpl;

#[async_trait]
impl TransitionExecutor for TransitionExecutorImpl {
    async fn execute_transition(
        &self,
        ctx: &TransitionContext<'_>,
        previous_state: &StateMachineState,
        event: &Event,
        transition: TransitionResult,
    ) -> (FlowContinuation, StateMachineState) {
        let TransitionResult {
            new_state,
            actions,
            continuation,
        } = transition;

        match ActionExecutor.execute_all(ctx, actions).await {
            Ok(()) => (continuation, new_state),
            Err(error) => {
                tracing::warn!(
                    flow_id = %ctx.flow_id,
                    event = event.name(),
                    %error,
                    "Error while executing actions, moving flow to errored state"
                );
                TransitionMetrics::record_failure();
                let mut state = previous_state.clone();
                let error_state = std::mem::take(&mut state.checkpoint.error_state);
                state.checkpoint.error_state =
                    error_state.with_error(FlowError::infrastructure(error.to_string()));
                state.is_removed = false;
                (FlowContinuation::ProcessEvents, state)
            }
        }
    }
}

/// Assemble the interceptor chain.
///
/// The hospital and metrics interceptors are always present. History dumps,
/// checkpoint verification and tracing are enabled by configuration; a
/// checker must be passed for verification to run.
#[must_use]
pub fn build_transition_executor(
    config: &StateMachineConfig,
    hospital: Arc<FlowHospital>,
    checker: Option<Arc<CheckpointChecker>>,
) -> Box<dyn TransitionExecutor> {
    let mut executor: Box<dyn TransitionExecutor> = Box::new(TransitionExecutorImpl);
    if config.trace_transitions || tracing::enabled!(tracing::Level::DEBUG) {
        executor = Box::new(PrintingInterceptor::new(executor));
    }
    if let Some(checker) = checker {
        executor = Box::new(DeserializationCheckInterceptor::new(executor, checker));
    }
    if config.dev_mode {
        executor = Box::new(DumpHistoryInterceptor::new(executor));
    }
    executor = Box::new(MetricInterceptor::new(executor));
    Box::new(HospitalisingInterceptor::new(executor, hospital))
}
