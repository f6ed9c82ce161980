//! Events entering the state machine from outside, and their acknowledgement.
//!
//! Every inbound message comes with a [`DeduplicationHandler`]. The state
//! machine must call [`DeduplicationHandler::after_database_transaction`]
//! exactly once per delivery, whether the message was processed or
//! discarded. Until then the messaging layer keeps the message and redelivers
//! it after a crash.

use crate::context::InvocationContext;
use crate::error::{FlowError, FlowErrorKind};
use crate::flow::FrozenFlow;
use crate::id::{DeduplicationId, FlowId};
use crate::identity::Party;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Acknowledgement hook of one inbound delivery.
pub trait DeduplicationHandler: Send + Sync + fmt::Debug {
    /// Id of the delivered message.
    fn deduplication_id(&self) -> &DeduplicationId;

    /// Called inside the transaction that persists the effects of the message,
    /// so the "already seen" fact commits atomically with them.
    fn inside_database_transaction(&self) {}

    /// Called after that transaction committed, or when the message is dropped.
    fn after_database_transaction(&self);
}

/// A message as handed over by the messaging layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Legal name of the sender.
    pub peer: String,
    /// Platform version the sender runs.
    pub platform_version: u32,
    /// Encoded [`SessionMessage`](crate::session::SessionMessage).
    pub data: Vec<u8>,
}

/// An inbound peer message.
#[derive(Clone, Debug)]
pub struct ExternalMessageEvent {
    /// The message.
    pub received_message: ReceivedMessage,
    /// Its acknowledgement hook.
    pub deduplication_handler: Arc<dyn DeduplicationHandler>,
}

/// A request to start a flow, for example from a scheduler or a client
/// connection that has its own redelivery.
#[derive(Clone, Debug)]
pub struct ExternalStartFlowEvent {
    /// The flow's initial logic.
    pub frozen_flow: FrozenFlow,
    /// Invocation context to start it in.
    pub context: InvocationContext,
    /// Acknowledgement hook, if the request source redelivers.
    pub deduplication_handler: Option<Arc<dyn DeduplicationHandler>>,
    /// Identity to act as, if not the node's default one.
    pub our_identity: Option<Party>,
    reply: StartFlowReply,
}

impl ExternalStartFlowEvent {
    /// Create a start request and the receiver its handle will be sent to.
    #[must_use]
    pub fn new(
        frozen_flow: FrozenFlow,
        context: InvocationContext,
        deduplication_handler: Option<Arc<dyn DeduplicationHandler>>,
    ) -> (Self, oneshot::Receiver<FlowHandle>) {
        let (reply, receiver) = StartFlowReply::channel();
        (
            Self {
                frozen_flow,
                context,
                deduplication_handler,
                our_identity: None,
                reply,
            },
            receiver,
        )
    }

    /// Act as `party` instead of the node's default identity.
    #[must_use]
    pub fn with_identity(mut self, party: Party) -> Self {
        self.our_identity = Some(party);
        self
    }

    /// Where the flow's handle goes once it has started.
    #[must_use]
    pub const fn reply(&self) -> &StartFlowReply {
        &self.reply
    }
}

/// Anything delivered to the state machine from outside.
#[derive(Clone, Debug)]
pub enum ExternalEvent {
    /// A peer message.
    Message(ExternalMessageEvent),
    /// A flow start request.
    StartFlow(ExternalStartFlowEvent),
}

impl ExternalEvent {
    /// Pair the event's handler with the event itself, if it has a handler.
    #[must_use]
    pub fn deduplication_handle(&self) -> Option<DeduplicationHandle> {
        let handler = match self {
            Self::Message(event) => Some(Arc::clone(&event.deduplication_handler)),
            Self::StartFlow(event) => event.deduplication_handler.clone(),
        };
        handler.map(|handler| DeduplicationHandle::new(handler, self.clone()))
    }
}

/// A deduplication handler together with the event it acknowledges.
///
/// Flows keep these until the effects of the event are checkpointed. If the
/// flow has to be retried before that, the event is delivered again.
#[derive(Clone)]
pub struct DeduplicationHandle {
    handler: Arc<dyn DeduplicationHandler>,
    external_cause: ExternalEvent,
}

impl DeduplicationHandle {
    /// Pair a handler with its event.
    #[must_use]
    pub fn new(handler: Arc<dyn DeduplicationHandler>, external_cause: ExternalEvent) -> Self {
        Self {
            handler,
            external_cause,
        }
    }

    /// Id of the acknowledged message.
    #[must_use]
    pub fn deduplication_id(&self) -> &DeduplicationId {
        self.handler.deduplication_id()
    }

    /// The event to deliver again on retry.
    #[must_use]
    pub const fn external_cause(&self) -> &ExternalEvent {
        &self.external_cause
    }

    /// See [`DeduplicationHandler::inside_database_transaction`].
    pub fn inside_database_transaction(&self) {
        self.handler.inside_database_transaction();
    }

    /// See [`DeduplicationHandler::after_database_transaction`].
    pub fn after_database_transaction(&self) {
        self.handler.after_database_transaction();
    }
}

impl fmt::Debug for DeduplicationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeduplicationHandle")
            .field(self.deduplication_id())
            .finish()
    }
}

/// Outcome of a flow: its serialized return value, or the error it failed with.
pub type FlowResult = Result<Vec<u8>, FlowError>;

/// Handle to a started flow.
#[derive(Debug)]
pub struct FlowHandle {
    /// The flow's id.
    pub id: FlowId,
    result: oneshot::Receiver<FlowResult>,
}

impl FlowHandle {
    /// Create a handle over a result channel.
    #[must_use]
    pub const fn new(id: FlowId, result: oneshot::Receiver<FlowResult>) -> Self {
        Self { id, result }
    }

    /// Wait for the flow to finish.
    ///
    /// # Errors
    ///
    /// Returns the flow's error, or a [`FlowErrorKind::Shutdown`] error if the
    /// flow was removed without an outcome (killed, or the node shut down).
    pub async fn result(self) -> FlowResult {
        self.result.await.unwrap_or_else(|_| {
            Err(FlowError::new(
                FlowErrorKind::Shutdown,
                "Flow was removed before it completed",
            ))
        })
    }

    /// Wait for the flow to finish and decode its return value.
    ///
    /// # Errors
    ///
    /// Returns the flow's error, or a logic error if the value does not decode as `T`.
    pub async fn result_as<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        let bytes = self.result().await?;
        bincode::deserialize(&bytes)
            .map_err(|e| FlowError::logic(format!("Cannot decode flow result: {e}")))
    }
}

/// One-shot reply slot of an [`ExternalStartFlowEvent`].
///
/// Cloneable because the event is, but only the first completion is delivered.
#[derive(Clone)]
pub struct StartFlowReply(Arc<Mutex<Option<oneshot::Sender<FlowHandle>>>>);

impl StartFlowReply {
    /// Create a reply slot and its receiver.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<FlowHandle>) {
        let (sender, receiver) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(sender)))), receiver)
    }

    /// Send the handle. Returns false if it was already sent or nobody listens.
    pub fn complete(&self, handle: FlowHandle) -> bool {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        sender.is_some_and(|sender| sender.send(handle).is_ok())
    }
}

impl fmt::Debug for StartFlowReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StartFlowReply")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingHandler {
        id: DeduplicationId,
        acks: AtomicUsize,
    }

    impl DeduplicationHandler for CountingHandler {
        fn deduplication_id(&self) -> &DeduplicationId {
            &self.id
        }

        fn after_database_transaction(&self) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn message_event(handler: Arc<CountingHandler>) -> ExternalEvent {
        ExternalEvent::Message(ExternalMessageEvent {
            received_message: ReceivedMessage {
                peer: "O=Bob".to_string(),
                platform_version: 1,
                data: vec![],
            },
            deduplication_handler: handler,
        })
    }

    #[test]
    fn message_events_always_have_a_handle() {
        let handler = Arc::new(CountingHandler {
            id: DeduplicationId::new("m-1"),
            acks: AtomicUsize::new(0),
        });
        let handle = message_event(Arc::clone(&handler))
            .deduplication_handle()
            .unwrap();
        assert_eq!(handle.deduplication_id().as_str(), "m-1");

        handle.after_database_transaction();
        assert_eq!(handler.acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_requests_without_handler_have_no_handle() {
        let (event, _receiver) = ExternalStartFlowEvent::new(
            FrozenFlow::new("ping", vec![]),
            InvocationContext::rpc("admin"),
            None,
        );
        assert!(ExternalEvent::StartFlow(event).deduplication_handle().is_none());
    }

    #[tokio::test]
    async fn reply_is_delivered_once() {
        let (reply, receiver) = StartFlowReply::channel();
        let (_result_tx, result_rx) = oneshot::channel();
        let id = FlowId::random();

        assert!(reply.clone().complete(FlowHandle::new(id, result_rx)));
        let (_tx, other_rx) = oneshot::channel();
        assert!(!reply.complete(FlowHandle::new(FlowId::random(), other_rx)));

        assert_eq!(receiver.await.unwrap().id, id);
    }

    #[tokio::test]
    async fn dropped_result_sender_reads_as_shutdown() {
        let (tx, rx) = oneshot::channel::<FlowResult>();
        drop(tx);
        let error = FlowHandle::new(FlowId::random(), rx).result().await.unwrap_err();
        assert_eq!(error.kind(), FlowErrorKind::Shutdown);
    }
}
