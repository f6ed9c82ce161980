//! The Flow State Machine Manager.
//!
//! [`FlowStateMachineManager`] is a cheap, cloneable handle over the shared
//! supervisor state. It owns the flow registry, the session router and the
//! timeout map (all inside one [`ConcurrentBox`]), the lifecycle, and the
//! transition pipeline every flow runs through.
//!
//! # Lock order
//!
//! `lifecycle` → `external_event_lock` → `inner`. No guard is ever held
//! across an `.await`.

use crate::config::StateMachineConfig;
use crate::error::ManagerError;
use crate::event_queue::EventQueue;
use crate::execution::{ExecutionGuard, FlowExecution};
use crate::hospital::FlowHospital;
use crate::inner_state::{Change, ConcurrentBox, Flow, FlowInfo, InnerState, ScheduledTimeout};
use crate::interceptors::CheckpointChecker;
use crate::lifecycle::{LifeCycle, LifeCycleState};
use crate::metrics::{CheckpointMetrics, FlowMetrics};
use crate::timeout::{random_jitter, timeout_delay};
use crate::transition_executor::{TransitionExecutor, build_transition_executor};
use flowmachine_core::action::FlowRemovalReason;
use flowmachine_core::catalog::FlowCatalog;
use flowmachine_core::checkpoint::{Checkpoint, CheckpointError, FlowStart, SerializedCheckpoint};
use flowmachine_core::checkpoint_store::CheckpointStore;
use flowmachine_core::context::{Clock, InvocationContext};
use flowmachine_core::error::{FlowError, FlowErrorKind};
use flowmachine_core::event::Event;
use flowmachine_core::external::{
    DeduplicationHandle, DeduplicationHandler, ExternalEvent, ExternalStartFlowEvent, FlowHandle,
    FlowResult, StartFlowReply,
};
use flowmachine_core::flow::FlowLogic;
use flowmachine_core::id::{FlowId, SessionId};
use flowmachine_core::identity::{NetworkMapCache, Party};
use flowmachine_core::messaging::{ExternalEventSink, FlowMessaging};
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::StateMachine;
use futures::StreamExt;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::Instrument;

/// Collaborators the manager works against.
#[derive(Clone)]
pub struct StateMachineServices {
    /// Durable checkpoint storage.
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    /// Peer-to-peer transport.
    pub messaging: Arc<dyn FlowMessaging>,
    /// Resolves message senders.
    pub network_map: Arc<dyn NetworkMapCache>,
    /// Known flow types and responders.
    pub catalog: Arc<FlowCatalog>,
    /// Time source for hospital records.
    pub clock: Arc<dyn Clock>,
}

pub(crate) struct Shared {
    pub(crate) config: StateMachineConfig,
    pub(crate) our_identity: Party,
    pub(crate) services: StateMachineServices,
    pub(crate) lifecycle: LifeCycle,
    pub(crate) inner: ConcurrentBox<InnerState>,
    /// Shared by inbound deliveries, exclusive while a flow is being replaced.
    pub(crate) external_event_lock: RwLock<()>,
    pub(crate) state_machine: StateMachine,
    pub(crate) transition_executor: Box<dyn TransitionExecutor>,
    pub(crate) hospital: Arc<FlowHospital>,
    pub(crate) checkpoint_checker: Option<Arc<CheckpointChecker>>,
    pub(crate) executions: Arc<watch::Sender<usize>>,
    pub(crate) runtime: OnceLock<Handle>,
}

/// A flow about to be registered.
struct NewFlow {
    state: StateMachineState,
    logic: Box<dyn FlowLogic>,
    result: Option<oneshot::Sender<FlowResult>>,
    pending_start: Option<(StartFlowReply, FlowHandle)>,
}

/// Supervisor of all flows on the node.
///
/// # Example
///
/// ```ignore
/// let manager = FlowStateMachineManager::new(config, our_identity, services);
/// manager.start(node_ready).await?;
///
/// let handle = manager
///     .start_flow(&PingFlow::new(peer), InvocationContext::rpc("alice"), None, None)
///     .await?;
/// let reply: String = handle.result_as().await?;
///
/// manager.stop(0).await?;
/// ```
#[derive(Clone)]
pub struct FlowStateMachineManager {
    shared: Arc<Shared>,
}

impl FlowStateMachineManager {
    /// Create a manager with the default Flow Hospital.
    #[must_use]
    pub fn new(config: StateMachineConfig, our_identity: Party, services: StateMachineServices) -> Self {
        let hospital = Arc::new(FlowHospital::new(&config.hospital, Arc::clone(&services.clock)));
        Self::with_hospital(config, our_identity, services, hospital)
    }

    /// Create a manager with a custom Flow Hospital.
    #[must_use]
    pub fn with_hospital(
        config: StateMachineConfig,
        our_identity: Party,
        services: StateMachineServices,
        hospital: Arc<FlowHospital>,
    ) -> Self {
        let checkpoint_checker = config
            .check_checkpoints
            .then(|| Arc::new(CheckpointChecker::new(Arc::clone(&services.catalog))));
        let transition_executor =
            build_transition_executor(&config, Arc::clone(&hospital), checkpoint_checker.clone());
        let inner = ConcurrentBox::new(InnerState::new());

        Self {
            shared: Arc::new(Shared {
                config,
                our_identity,
                services,
                lifecycle: LifeCycle::new(),
                inner,
                external_event_lock: RwLock::new(()),
                state_machine: StateMachine::new(),
                transition_executor,
                hospital,
                checkpoint_checker,
                executions: Arc::new(watch::Sender::new(0)),
                runtime: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// The collaborators.
    #[must_use]
    pub fn services(&self) -> &StateMachineServices {
        &self.shared.services
    }

    /// The Flow Hospital, for operators.
    #[must_use]
    pub fn hospital(&self) -> &Arc<FlowHospital> {
        &self.shared.hospital
    }

    /// Current lifecycle stage.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifeCycleState {
        self.shared.lifecycle.state()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start the manager and restore every persisted flow.
    ///
    /// Restored flows and inbound delivery stay paused until `node_ready`
    /// resolves. A checkpoint that cannot be restored is logged and skipped.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::NoRuntime`] when not called from a tokio runtime
    /// - [`ManagerError::WrongLifeCycle`] unless the manager is `UNSTARTED`
    #[tracing::instrument(skip_all, name = "manager_start")]
    pub async fn start<F>(&self, node_ready: F) -> Result<(), ManagerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        self.shared
            .lifecycle
            .transition(LifeCycleState::Unstarted, LifeCycleState::Started)?;
        let _ = self.shared.runtime.set(runtime.clone());
        if let Some(checker) = &self.shared.checkpoint_checker {
            checker.start();
        }

        let restored = self.restore_checkpoints().await;
        tracing::info!(count = restored.len(), "Restored flows from checkpoints");

        let shared = Arc::downgrade(&self.shared);
        runtime.spawn(async move {
            node_ready.await;
            let Some(strong) = shared.upgrade() else {
                return;
            };
            strong.inner.read(|inner| {
                for flow_id in &restored {
                    if let Some(flow) = inner.flows.get(flow_id) {
                        flow.queue.push(Event::DoRemainingWork);
                    }
                }
            });
            tracing::info!("Node ready, enabling inbound delivery");
            strong.services.messaging.start(external_event_sink(shared));
        });
        Ok(())
    }

    async fn restore_checkpoints(&self) -> Vec<FlowId> {
        let mut restored = Vec::new();
        let mut checkpoints = self.shared.services.checkpoint_store.get_all();
        while let Some(item) = checkpoints.next().await {
            let (flow_id, serialized) = match item {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::error!(%error, "Failed to read a stored checkpoint");
                    continue;
                }
            };
            let (state, logic) = match self.restore(flow_id, &serialized) {
                Ok(restored) => restored,
                Err(error) => {
                    tracing::error!(flow_id = %flow_id, %error, "Unable to restore flow, skipping it");
                    continue;
                }
            };
            let added = self.shared.inner.write(|inner| {
                if inner.flows.contains_key(&flow_id) {
                    return None;
                }
                let new_flow = NewFlow {
                    state,
                    logic,
                    result: None,
                    pending_start: None,
                };
                Some(self.add_and_start_flow(inner, new_flow, false, true))
            });
            match added {
                Some(is_timed) => {
                    if is_timed {
                        self.schedule_flow_timeout(flow_id);
                    }
                    restored.push(flow_id);
                }
                None => tracing::debug!(flow_id = %flow_id, "Flow already registered, not restoring"),
            }
        }
        restored
    }

    fn restore(
        &self,
        flow_id: FlowId,
        serialized: &SerializedCheckpoint,
    ) -> Result<(StateMachineState, Box<dyn FlowLogic>), CheckpointError> {
        let checkpoint = serialized.deserialize()?;
        let logic = self
            .shared
            .services
            .catalog
            .thaw(checkpoint.flow_state.frozen_flow())?;
        Ok((StateMachineState::restored(flow_id, checkpoint), logic))
    }

    /// Shut down every flow and wait for their execution units to end.
    ///
    /// Flows are left in the checkpoint store for the next start. Waits until
    /// at most `allowed_unstopped` executions remain; there is no deadline.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::WrongLifeCycle`] unless the manager is `STARTED`
    /// - [`ManagerError::UnrestorableCheckpoints`] if checkpoint verification
    ///   found checkpoints that could not be restored
    #[tracing::instrument(skip(self), name = "manager_stop")]
    pub async fn stop(&self, allowed_unstopped: usize) -> Result<(), ManagerError> {
        self.shared
            .lifecycle
            .transition(LifeCycleState::Started, LifeCycleState::Stopping)?;
        let live = self.shared.inner.write(|inner| {
            inner.stopping = true;
            for (_, scheduled) in inner.timed_flows.drain() {
                scheduled.timer.abort();
            }
            for flow in inner.flows.values() {
                flow.queue.push(Event::SoftShutdown);
            }
            inner.flows.len()
        });
        tracing::info!(flows = live, allowed_unstopped, "Stopping flows");

        let mut executions = self.shared.executions.subscribe();
        let _ = executions
            .wait_for(|running| *running <= allowed_unstopped)
            .await;
        self.shared
            .lifecycle
            .transition(LifeCycleState::Stopping, LifeCycleState::Stopped)?;

        if let Some(checker) = &self.shared.checkpoint_checker {
            checker.stop().await;
            let unrestorable = checker.unrestorable();
            if unrestorable > 0 {
                tracing::error!(unrestorable, "Found unrestorable checkpoints");
                return Err(ManagerError::UnrestorableCheckpoints(unrestorable));
            }
        }
        tracing::info!("Flow state machine manager stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Flow lifecycle
    // ---------------------------------------------------------------------

    /// Start a flow.
    ///
    /// The returned handle is delivered once the flow has begun executing,
    /// not once it finishes. `our_identity` overrides the node's default
    /// identity. The flow type must be registered in the catalog.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::WrongLifeCycle`] unless the manager is `STARTED`
    /// - [`ManagerError::Checkpoint`] if the logic cannot be frozen
    /// - [`ManagerError::FlowNotStarted`] if the flow was dropped before it began
    #[tracing::instrument(skip_all, fields(flow = logic.flow_name()))]
    pub async fn start_flow(
        &self,
        logic: &dyn FlowLogic,
        context: InvocationContext,
        our_identity: Option<Party>,
        deduplication_handler: Option<Arc<dyn DeduplicationHandler>>,
    ) -> Result<FlowHandle, ManagerError> {
        self.shared.lifecycle.require(LifeCycleState::Started)?;
        let frozen_flow = logic.freeze()?;
        let (mut event, started) =
            ExternalStartFlowEvent::new(frozen_flow, context, deduplication_handler);
        if let Some(party) = our_identity {
            event = event.with_identity(party);
        }
        self.deliver_external_event(ExternalEvent::StartFlow(event))?;
        started
            .await
            .map_err(|_| ManagerError::FlowNotStarted(logic.flow_name().to_string()))
    }

    pub(crate) fn on_external_start_flow(
        &self,
        event: ExternalStartFlowEvent,
        handle: Option<DeduplicationHandle>,
    ) {
        let logic = match self.shared.services.catalog.thaw(&event.frozen_flow) {
            Ok(logic) => logic,
            Err(error) => {
                tracing::error!(
                    flow = event.frozen_flow.flow_name(),
                    %error,
                    "Cannot start flow that is not in the catalog"
                );
                self.acknowledge(&handle.into_iter().collect::<Vec<_>>());
                return;
            }
        };
        let our_identity = event
            .our_identity
            .clone()
            .unwrap_or_else(|| self.shared.our_identity.clone());
        let checkpoint = Checkpoint::create(
            event.context.clone(),
            FlowStart::Explicit,
            event.frozen_flow.clone(),
            our_identity,
            logic.is_timed(),
        );
        self.start_flow_internal(
            FlowId::random(),
            checkpoint,
            logic,
            handle.into_iter().collect(),
            Some(event.reply().clone()),
        );
    }

    /// Register a brand new flow and schedule its first run.
    pub(crate) fn start_flow_internal(
        &self,
        flow_id: FlowId,
        checkpoint: Checkpoint,
        logic: Box<dyn FlowLogic>,
        pending: Vec<DeduplicationHandle>,
        reply: Option<StartFlowReply>,
    ) {
        let (result, receiver) = oneshot::channel();
        let state = StateMachineState::new(flow_id, checkpoint, pending, logic.is_idempotent());
        let new_flow = NewFlow {
            state,
            logic,
            result: Some(result),
            pending_start: reply.map(|reply| (reply, FlowHandle::new(flow_id, receiver))),
        };
        let is_timed = self
            .shared
            .inner
            .write(|inner| self.add_and_start_flow(inner, new_flow, true, true));
        if is_timed {
            self.schedule_flow_timeout(flow_id);
        }
        tracing::debug!(flow_id = %flow_id, "Flow registered");
    }

    /// Register a flow and spawn its execution unit. Returns whether the
    /// flow needs a timeout scheduled, which the caller does once the guard
    /// is released.
    fn add_and_start_flow(
        &self,
        inner: &mut InnerState,
        new_flow: NewFlow,
        resume: bool,
        publish: bool,
    ) -> bool {
        let NewFlow {
            state,
            logic,
            result,
            pending_start,
        } = new_flow;
        let flow_id = state.flow_id;
        let is_timed = state.checkpoint.is_timed();
        for session_id in state.checkpoint.session_ids() {
            inner.session_to_flow.insert(session_id, flow_id);
        }

        let queue = Arc::new(EventQueue::new());
        if resume {
            queue.push(Event::DoRemainingWork);
        }
        let flow_name = state.checkpoint.flow_name().to_string();
        let execution = FlowExecution::new(
            state,
            logic,
            Arc::clone(&queue),
            self.clone(),
            ExecutionGuard::new(&self.shared.executions),
        );
        let task = self.spawn(
            execution
                .run()
                .instrument(tracing::info_span!("flow", flow_id = %flow_id)),
        );

        let flow = Flow {
            flow_name,
            queue,
            task: Some(task),
            result,
            pending_start,
        };
        if publish {
            inner.publish(Change::Add(flow.info(flow_id)));
            FlowMetrics::record_started();
        }
        if inner.stopping {
            flow.queue.push(Event::SoftShutdown);
        }
        inner.flows.insert(flow_id, flow);
        FlowMetrics::set_in_flight(inner.flows.len());
        is_timed
    }

    fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.shared.runtime.get() {
            Some(runtime) => runtime.spawn(future).abort_handle(),
            None => tokio::spawn(future).abort_handle(),
        }
    }

    /// Complete the start future of a flow that has begun executing.
    pub(crate) fn signal_flow_has_started(&self, flow_id: FlowId) {
        let pending = self.shared.inner.write(|inner| {
            inner
                .flows
                .get_mut(&flow_id)
                .and_then(|flow| flow.pending_start.take())
        });
        if let Some((reply, handle)) = pending {
            if !reply.complete(handle) {
                tracing::debug!(flow_id = %flow_id, "Nobody waits for the flow to start");
            }
        }
    }

    /// Remove a flow that reached a terminal outcome.
    ///
    /// With several recorded errors the first one is the flow's result.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidRemoval`] without touching anything if
    /// an orderly finish still has pending deliveries, is inside a sub-flow,
    /// or is not marked removed.
    pub(crate) fn remove_flow(
        &self,
        flow_id: FlowId,
        reason: FlowRemovalReason,
        last_state: &StateMachineState,
    ) -> Result<(), ManagerError> {
        if matches!(reason, FlowRemovalReason::OrderlyFinish(_)) {
            validate_orderly_removal(flow_id, last_state)?;
        }
        let outcome: FlowResult = match &reason {
            FlowRemovalReason::OrderlyFinish(return_value) => Ok(return_value.clone()),
            FlowRemovalReason::ErrorFinish(errors) => Err(errors
                .first()
                .cloned()
                .unwrap_or_else(|| FlowError::logic("Flow failed without a recorded error"))),
            FlowRemovalReason::SoftShutdown => Err(shutdown_error()),
        };

        let removed = self.shared.inner.write(|inner| {
            let flow = inner.flows.remove(&flow_id)?;
            inner.cancel_timeout(flow_id);
            inner.unbind_flow(flow_id);
            inner.publish(Change::Removed(flow.info(flow_id), outcome.clone()));
            FlowMetrics::set_in_flight(inner.flows.len());
            Some(flow)
        });
        let Some(mut flow) = removed else {
            tracing::warn!(flow_id = %flow_id, "Flow re-finished");
            return Ok(());
        };

        let leftovers = mailbox_handles(&flow.queue);
        match reason {
            FlowRemovalReason::SoftShutdown => {
                // Left unacknowledged; the messaging layer redelivers them after restart.
                self.release(&leftovers);
                self.release(&last_state.pending_deduplication_handlers);
            }
            FlowRemovalReason::OrderlyFinish(_) | FlowRemovalReason::ErrorFinish(_) => {
                if !leftovers.is_empty() {
                    tracing::warn!(
                        flow_id = %flow_id,
                        count = leftovers.len(),
                        "Acknowledging deliveries left in the mailbox of a removed flow"
                    );
                }
                self.acknowledge(&leftovers);
                FlowMetrics::record_finished(outcome.is_ok());
            }
        }

        if let Some(result) = flow.result.take() {
            let _ = result.send(outcome);
        }
        if let Some((reply, handle)) = flow.pending_start.take() {
            reply.complete(handle);
        }
        self.shared.transition_executor.flow_removed(flow_id);
        tracing::info!(flow_id = %flow_id, flow = %flow.flow_name, reason = removal_name(&reason), "Flow removed");
        Ok(())
    }

    /// Kill a flow: stop it, delete its checkpoint and fail its result.
    ///
    /// Returns false if the flow is not known here, which is not an error: in
    /// a cluster it may live on another node.
    #[tracing::instrument(skip(self))]
    pub async fn kill_flow(&self, flow_id: FlowId) -> bool {
        let removed = self.shared.inner.write(|inner| {
            let flow = inner.flows.remove(&flow_id)?;
            inner.cancel_timeout(flow_id);
            inner.unbind_flow(flow_id);
            inner.publish(Change::Removed(flow.info(flow_id), Err(FlowError::killed())));
            FlowMetrics::set_in_flight(inner.flows.len());
            Some(flow)
        });
        let Some(mut flow) = removed else {
            tracing::debug!("Flow to kill is not known locally");
            return false;
        };
        if let Some(task) = flow.task.take() {
            task.abort();
        }
        self.acknowledge(&mailbox_handles(&flow.queue));

        match self.shared.services.checkpoint_store.remove(flow_id).await {
            Ok(true) => CheckpointMetrics::record_remove(),
            Ok(false) => {}
            Err(error) => tracing::warn!(%error, "Failed to delete checkpoint of killed flow"),
        }
        if let Some(result) = flow.result.take() {
            let _ = result.send(Err(FlowError::killed()));
        }
        if let Some((reply, handle)) = flow.pending_start.take() {
            reply.complete(handle);
        }
        self.shared.hospital.flow_removed(flow_id);
        self.shared.transition_executor.flow_removed(flow_id);
        FlowMetrics::record_finished(false);
        tracing::info!(flow = %flow.flow_name, "Flow killed");
        true
    }

    /// Ask a flow to restart from its last checkpoint, for example after an
    /// operator fixed what kept it under observation. Returns false for an
    /// unknown flow.
    pub fn retry_flow(&self, flow_id: FlowId) -> bool {
        self.shared.inner.read(|inner| {
            inner.flows.get(&flow_id).is_some_and(|flow| {
                flow.queue.push(Event::RetryFlowFromSafePoint);
                true
            })
        })
    }

    /// Replace a flow's execution unit with one rebuilt from its last
    /// checkpoint, then deliver again every external event it had not yet
    /// acknowledged, in their original order.
    ///
    /// A flow that was never persisted is removed instead; its start request
    /// is among the redelivered events. If the stored checkpoint is missing
    /// or unreadable the retry is abandoned and the flow stays as it is.
    pub(crate) async fn retry_flow_from_safe_point(&self, current_state: StateMachineState) {
        let flow_id = current_state.flow_id;
        let restored = if current_state.is_any_checkpoint_persisted {
            match self.load_checkpoint(flow_id).await {
                Some(restored) => Some(restored),
                None => return,
            }
        } else {
            None
        };

        // Delivery stays excluded until the old events are back in the new
        // mailbox, so nothing that arrives meanwhile can overtake them.
        let replaced = self.shared.lifecycle.with_state(|stage| {
            let _exclusive = self
                .shared
                .external_event_lock
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let replaced = self.shared.inner.write(|inner| {
                let old = inner.flows.remove(&flow_id)?;
                inner.unbind_flow(flow_id);

                let mut handles = current_state.pending_deduplication_handlers.clone();
                handles.extend(mailbox_handles(&old.queue));
                for handle in &handles {
                    inner.in_flight_deduplication.remove(handle.deduplication_id());
                }

                let is_timed = match restored {
                    Some((state, logic)) => {
                        let new_flow = NewFlow {
                            state,
                            logic,
                            result: old.result,
                            pending_start: old.pending_start,
                        };
                        self.add_and_start_flow(inner, new_flow, true, false)
                    }
                    None => {
                        inner.cancel_timeout(flow_id);
                        inner.publish(Change::Removed(
                            old.info(flow_id),
                            Err(FlowError::new(
                                FlowErrorKind::Shutdown,
                                "Flow restarted before its first checkpoint",
                            )),
                        ));
                        FlowMetrics::set_in_flight(inner.flows.len());
                        false
                    }
                };
                Some((handles, is_timed))
            })?;

            let (handles, is_timed) = replaced;
            if stage == LifeCycleState::Started {
                for handle in &handles {
                    self.route(handle.external_cause().clone());
                }
            } else {
                tracing::debug!(
                    flow_id = %flow_id,
                    stage = %stage,
                    "Not redelivering events outside the started stage"
                );
            }
            Some((handles.len(), is_timed))
        });

        let Some((redelivered, is_timed)) = replaced else {
            tracing::debug!(flow_id = %flow_id, "Flow left before it could be retried");
            return;
        };
        if !current_state.is_any_checkpoint_persisted {
            self.shared.transition_executor.flow_removed(flow_id);
        }
        if is_timed {
            self.schedule_flow_timeout(flow_id);
        } else {
            self.cancel_flow_timeout(flow_id);
        }
        FlowMetrics::record_retry();
        tracing::info!(
            flow_id = %flow_id,
            redelivered,
            from_checkpoint = current_state.is_any_checkpoint_persisted,
            "Retrying flow from its last safe point"
        );
    }

    async fn load_checkpoint(&self, flow_id: FlowId) -> Option<(StateMachineState, Box<dyn FlowLogic>)> {
        let serialized = match self.shared.services.checkpoint_store.get(flow_id).await {
            Ok(Some(serialized)) => serialized,
            Ok(None) => {
                tracing::error!(flow_id = %flow_id, "Checkpoint not found, abandoning retry");
                return None;
            }
            Err(error) => {
                tracing::error!(flow_id = %flow_id, %error, "Failed to load checkpoint, abandoning retry");
                return None;
            }
        };
        match self.restore(flow_id, &serialized) {
            Ok(restored) => Some(restored),
            Err(error) => {
                tracing::error!(flow_id = %flow_id, %error, "Unable to restore checkpoint, abandoning retry");
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Delivery and sessions
    // ---------------------------------------------------------------------

    /// Hand an external event to the manager.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::WrongLifeCycle`] unless the manager is `STARTED`.
    pub fn deliver_external_event(&self, event: ExternalEvent) -> Result<(), ManagerError> {
        self.shared
            .lifecycle
            .require_state(LifeCycleState::Started, || {
                let _shared = self
                    .shared
                    .external_event_lock
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                self.route(event);
            })
    }

    /// Route a session to a flow.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ConflictingSessionBinding`] if the session is
    /// already routed to another flow.
    pub(crate) fn add_session_binding(
        &self,
        flow_id: FlowId,
        session_id: SessionId,
    ) -> Result<(), ManagerError> {
        let existing = self.shared.inner.write(|inner| {
            match inner.session_to_flow.entry(session_id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(flow_id);
                    None
                }
                Entry::Occupied(occupied) => Some(*occupied.get()),
            }
        });
        match existing {
            None => Ok(()),
            Some(existing) if existing == flow_id => {
                tracing::warn!(flow_id = %flow_id, session_id = %session_id, "Session binding already exists");
                Ok(())
            }
            Some(existing) => Err(ManagerError::ConflictingSessionBinding {
                session_id,
                existing,
                requested: flow_id,
            }),
        }
    }

    /// Stop routing sessions.
    pub(crate) fn remove_session_bindings(&self, session_ids: &[SessionId]) {
        let absent: Vec<SessionId> = self.shared.inner.write(|inner| {
            session_ids
                .iter()
                .filter(|session_id| inner.session_to_flow.remove(session_id).is_none())
                .copied()
                .collect()
        });
        for session_id in absent {
            tracing::warn!(session_id = %session_id, "Session binding already removed");
        }
    }

    /// Acknowledge deliveries: they are no longer in flight, and the
    /// messaging layer may forget them.
    pub(crate) fn acknowledge(&self, handles: &[DeduplicationHandle]) {
        if handles.is_empty() {
            return;
        }
        self.release(handles);
        for handle in handles {
            handle.after_database_transaction();
        }
    }

    /// Forget that deliveries are in flight, without acknowledging them.
    pub(crate) fn release(&self, handles: &[DeduplicationHandle]) {
        if handles.is_empty() {
            return;
        }
        self.shared.inner.write(|inner| {
            for handle in handles {
                inner.in_flight_deduplication.remove(handle.deduplication_id());
            }
        });
    }

    // ---------------------------------------------------------------------
    // Timeouts
    // ---------------------------------------------------------------------

    /// Put a flow under timeout supervision, or back off its existing timer.
    ///
    /// Each call replaces the flow's timer with a longer one:
    /// `timeout × backoff_base^min(retries, max_restart_count)`, jittered.
    pub fn schedule_flow_timeout(&self, flow_id: FlowId) {
        let config = &self.shared.config.flow_timeout;
        self.shared.inner.write(|inner| {
            if !inner.flows.contains_key(&flow_id) {
                return;
            }
            let retry_count = inner
                .cancel_timeout(flow_id)
                .map_or(0, |scheduled| scheduled.retry_count);
            let delay = timeout_delay(config, retry_count, random_jitter());
            tracing::debug!(flow_id = %flow_id, retry_count, ?delay, "Scheduling flow timeout");
            self.arm_timeout(inner, flow_id, delay, retry_count + 1);
        });
    }

    /// Take a flow off timeout supervision.
    pub fn cancel_flow_timeout(&self, flow_id: FlowId) {
        self.shared.inner.write(|inner| {
            inner.cancel_timeout(flow_id);
        });
    }

    /// Replace a flow's timer with a custom one of `seconds`, keeping its
    /// retry count. Requests shorter than the configured timeout are ignored.
    pub fn reset_custom_timeout(&self, flow_id: FlowId, seconds: u64) {
        let requested = Duration::from_secs(seconds);
        let floor = self.shared.config.flow_timeout.timeout;
        if requested < floor {
            tracing::debug!(
                flow_id = %flow_id,
                ?requested,
                ?floor,
                "Ignoring custom timeout below the configured timeout"
            );
            return;
        }
        self.shared.inner.write(|inner| {
            if !inner.flows.contains_key(&flow_id) {
                return;
            }
            let retry_count = inner
                .cancel_timeout(flow_id)
                .map_or(0, |scheduled| scheduled.retry_count);
            self.arm_timeout(inner, flow_id, requested, retry_count);
        });
    }

    fn arm_timeout(&self, inner: &mut InnerState, flow_id: FlowId, delay: Duration, retry_count: u32) {
        let shared = Arc::downgrade(&self.shared);
        let timer = self.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.inner.read(|inner| {
                if let Some(flow) = inner.flows.get(&flow_id) {
                    tracing::info!(flow_id = %flow_id, "Flow timed out");
                    flow.queue.push(Event::Error(FlowError::timeout()));
                }
            });
        });
        inner
            .timed_flows
            .insert(flow_id, ScheduledTimeout { timer, retry_count });
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    /// The registered flows, and every change after that moment.
    ///
    /// Both are taken under one guard, so the feed neither misses nor
    /// repeats a change relative to the list.
    #[must_use]
    pub fn track(&self) -> (Vec<FlowInfo>, mpsc::UnboundedReceiver<Change>) {
        self.shared.inner.write(|inner| {
            let flows = inner.flows.iter().map(|(id, flow)| flow.info(*id)).collect();
            (flows, inner.subscribe())
        })
    }

    /// The registered flows.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlowInfo> {
        self.shared.inner.read(|inner| {
            inner
                .flows
                .iter()
                .map(|(id, flow)| flow.info(*id))
                .collect()
        })
    }
}

impl fmt::Debug for FlowStateMachineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStateMachineManager")
            .field("our_identity", &self.shared.our_identity)
            .field("lifecycle", &self.shared.lifecycle.state())
            .finish_non_exhaustive()
    }
}

/// Inbound events go through a weak reference so the messaging layer does
/// not keep a dropped manager alive.
fn external_event_sink(shared: Weak<Shared>) -> ExternalEventSink {
    Arc::new(move |event| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let manager = FlowStateMachineManager { shared };
        if let Err(error) = manager.deliver_external_event(event) {
            tracing::info!(%error, "Dropping inbound event, it will be redelivered");
        }
    })
}

fn validate_orderly_removal(flow_id: FlowId, state: &StateMachineState) -> Result<(), ManagerError> {
    let reason = if !state.pending_deduplication_handlers.is_empty() {
        format!(
            "{} deliveries are still unacknowledged",
            state.pending_deduplication_handlers.len()
        )
    } else if state.checkpoint.sub_flow_stack.len() != 1 {
        format!(
            "sub-flow stack has depth {}",
            state.checkpoint.sub_flow_stack.len()
        )
    } else if !state.is_removed {
        "state is not marked removed".to_string()
    } else {
        return Ok(());
    };
    Err(ManagerError::InvalidRemoval { flow_id, reason })
}

fn mailbox_handles(queue: &EventQueue) -> Vec<DeduplicationHandle> {
    queue
        .drain()
        .iter()
        .filter_map(Event::deduplication_handle)
        .cloned()
        .collect()
}

fn shutdown_error() -> FlowError {
    FlowError::new(FlowErrorKind::Shutdown, "Node shut down before the flow completed")
}

const fn removal_name(reason: &FlowRemovalReason) -> &'static str {
    match reason {
        FlowRemovalReason::OrderlyFinish(_) => "orderly_finish",
        FlowRemovalReason::ErrorFinish(_) => "error_finish",
        FlowRemovalReason::SoftShutdown => "soft_shutdown",
    }
}
