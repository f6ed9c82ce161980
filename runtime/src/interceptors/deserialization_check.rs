use crate::transition_executor::{TransitionContext, TransitionExecutor};
use async_trait::async_trait;
use flowmachine_core::catalog::FlowCatalog;
use flowmachine_core::checkpoint::{Checkpoint, CheckpointError};
use flowmachine_core::event::Event;
use flowmachine_core::id::FlowId;
use flowmachine_core::state::StateMachineState;
use flowmachine_core::transition::{FlowContinuation, TransitionResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type CheckRequest = (FlowId, Box<Checkpoint>);

/// Verifies in the background that checkpoints can be restored.
///
/// Every checkpoint handed to [`check`](Self::check) is serialized,
/// deserialized and its flow thawed through the catalog, off the flow's own
/// task. Failures are logged and counted.
pub struct CheckpointChecker {
    catalog: Arc<FlowCatalog>,
    sender: Mutex<Option<mpsc::UnboundedSender<CheckRequest>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<CheckRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    unrestorable: Arc<AtomicUsize>,
}

impl CheckpointChecker {
    /// Create a checker. Nothing is verified until [`start`](Self::start).
    #[must_use]
    pub fn new(catalog: Arc<FlowCatalog>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            catalog,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            unrestorable: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the worker. Must run inside a tokio runtime; later calls do nothing.
    pub fn start(&self) {
        let Some(mut receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let catalog = Arc::clone(&self.catalog);
        let unrestorable = Arc::clone(&self.unrestorable);
        let worker = tokio::spawn(async move {
            while let Some((flow_id, checkpoint)) = receiver.recv().await {
                if let Err(error) = verify(&catalog, &checkpoint) {
                    tracing::error!(flow_id = %flow_id, %error, "Checkpoint cannot be restored");
                    unrestorable.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    /// Queue a checkpoint for verification.
    pub fn check(&self, flow_id: FlowId, checkpoint: Checkpoint) {
        if let Some(sender) = &*self.sender.lock().unwrap_or_else(PoisonError::into_inner) {
            let _ = sender.send((flow_id, Box::new(checkpoint)));
        }
    }

    /// Number of checkpoints found unrestorable so far.
    #[must_use]
    pub fn unrestorable(&self) -> usize {
        self.unrestorable.load(Ordering::SeqCst)
    }

    /// Stop accepting checkpoints and wait for the queued ones to be verified.
    pub async fn stop(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

fn verify(catalog: &FlowCatalog, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let restored = checkpoint.serialize()?.deserialize()?;
    catalog.thaw(restored.flow_state.frozen_flow())?;
    Ok(())
}

/// Sends every new checkpoint to a [`CheckpointChecker`].
pub struct DeserializationCheckInterceptor {
    delegate: Box<dyn TransitionExecutor>,
    checker: Arc<CheckpointChecker>,
}

impl DeserializationCheckInterceptor {
    /// Wrap `delegate`.
    #[must_use]
    pub fn new(delegate: Box<dyn TransitionExecutor>, checker: Arc<CheckpointChecker>) -> Self {
        Self { delegate, checker }
    }
}

#[async_trait]
impl TransitionExecutor for DeserializationCheckInterceptor {
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
        if !next_state.is_removed && next_state.checkpoint != previous_state.checkpoint {
            self.checker
                .check(next_state.flow_id, next_state.checkpoint.clone());
        }
        (continuation, next_state)
    }
}
