//! Messaging doubles: a recorder and an in-memory network of nodes.

use crate::mocks::TestDeduplicationHandler;
use flowmachine_core::external::{ExternalEvent, ExternalMessageEvent, ReceivedMessage};
use flowmachine_core::id::SenderDeduplicationId;
use flowmachine_core::identity::Party;
use flowmachine_core::messaging::{ExternalEventSink, FlowMessaging, MessagingError};
use flowmachine_core::session::SessionMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;

/// A message handed to the messaging layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    /// Recipient.
    pub party: Party,
    /// The message.
    pub message: SessionMessage,
    /// Id the recipient deduplicates on.
    pub deduplication_id: SenderDeduplicationId,
}

/// [`FlowMessaging`] that records every send.
///
/// Standalone it only records. Obtained from an [`InMemoryNetwork`] it also
/// delivers each message to the recipient node, synchronously.
///
/// Inbound deliveries made before [`FlowMessaging::start`] are held back and
/// handed over when it is called, like a broker keeping messages for a node
/// that is still booting.
pub struct RecordingMessaging {
    party: Party,
    network: Option<InMemoryNetwork>,
    sent: Mutex<Vec<SentMessage>>,
    delivered: Mutex<Vec<Arc<TestDeduplicationHandler>>>,
    held_back: Mutex<Vec<ExternalEvent>>,
    sink: Mutex<Option<ExternalEventSink>>,
    notify: Notify,
}

impl RecordingMessaging {
    /// Messaging of `party`, not connected to anything
    #[must_use]
    pub fn new(party: Party) -> Self {
        Self::connected(party, None)
    }

    fn connected(party: Party, network: Option<InMemoryNetwork>) -> Self {
        Self {
            party,
            network,
            sent: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            held_back: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// The party this messaging sends as
    #[must_use]
    pub const fn party(&self) -> &Party {
        &self.party
    }

    /// Everything sent so far, oldest first
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether `start` was called
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Wait until at least `count` messages were sent, then return them
    pub async fn wait_for(&self, count: usize) -> Vec<SentMessage> {
        loop {
            let notified = self.notify.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            notified.await;
        }
    }

    /// Deliver `message` from `sender` as if it arrived over the wire
    ///
    /// Returns the delivery's handler so the test can check it was
    /// acknowledged. Delivering twice with the same `id` simulates a
    /// redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Encode`] if the message cannot be encoded.
    pub fn deliver(
        &self,
        sender: &Party,
        message: &SessionMessage,
        id: &str,
    ) -> Result<Arc<TestDeduplicationHandler>, MessagingError> {
        let data = message
            .to_bytes()
            .map_err(|e| MessagingError::Encode(e.to_string()))?;
        Ok(self.receive(sender.name(), data, id))
    }

    /// Deliver raw bytes from `peer`, which need not decode or be a known party
    pub fn receive(&self, peer: &str, data: Vec<u8>, id: &str) -> Arc<TestDeduplicationHandler> {
        let handler = Arc::new(TestDeduplicationHandler::new(id));
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&handler));
        let event = ExternalEvent::Message(ExternalMessageEvent {
            received_message: ReceivedMessage {
                peer: peer.to_string(),
                platform_version: 1,
                data,
            },
            deduplication_handler: handler.clone(),
        });

        // Clone the sink out so a sink that sends back into this node does
        // not find the lock taken.
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => sink(event),
            None => self
                .held_back
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event),
        }
        handler
    }

    /// Deliveries made to this node that were never acknowledged
    #[must_use]
    pub fn unacknowledged(&self) -> usize {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handler| handler.acks() == 0)
            .count()
    }
}

impl fmt::Debug for RecordingMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingMessaging")
            .field("party", &self.party)
            .field("sent", &self.sent.lock().unwrap_or_else(PoisonError::into_inner).len())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl FlowMessaging for RecordingMessaging {
    fn start(&self, sink: ExternalEventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&sink));
        let held_back =
            std::mem::take(&mut *self.held_back.lock().unwrap_or_else(PoisonError::into_inner));
        for event in held_back {
            sink(event);
        }
    }

    fn send_session_message(
        &self,
        party: &Party,
        message: SessionMessage,
        deduplication_id: SenderDeduplicationId,
    ) -> Result<(), MessagingError> {
        let data = match &self.network {
            Some(_) => Some(
                message
                    .to_bytes()
                    .map_err(|e| MessagingError::Encode(e.to_string()))?,
            ),
            None => None,
        };
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                party: party.clone(),
                message,
                deduplication_id,
            });
        self.notify.notify_waiters();

        if let (Some(network), Some(data)) = (&self.network, data) {
            let recipient = network.node(party).ok_or_else(|| MessagingError::SendFailed {
                party: party.to_string(),
                reason: "not on the network".to_string(),
            })?;
            let id = format!("{}/{deduplication_id}", self.party);
            recipient.receive(self.party.name(), data, &id);
        }
        Ok(())
    }
}

/// A set of nodes that deliver to each other in memory.
///
/// # Example
///
/// ```ignore
/// let network = InMemoryNetwork::new();
/// let alice = network.messaging(Party::new("O=Alice"));
/// let bob = network.messaging(Party::new("O=Bob"));
/// // Hand `alice` and `bob` to two managers; their flows can now talk.
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryNetwork {
    nodes: Arc<Mutex<HashMap<String, Weak<RecordingMessaging>>>>,
}

impl InMemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `party` to the network and return its messaging
    #[must_use]
    pub fn messaging(&self, party: Party) -> Arc<RecordingMessaging> {
        let messaging = Arc::new(RecordingMessaging::connected(
            party.clone(),
            Some(self.clone()),
        ));
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(party.name().to_string(), Arc::downgrade(&messaging));
        messaging
    }

    fn node(&self, party: &Party) -> Option<Arc<RecordingMessaging>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(party.name())
            .and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use flowmachine_core::id::SessionId;
    use flowmachine_core::session::{ExistingSessionMessage, ExistingSessionPayload};

    fn end(session: u64) -> SessionMessage {
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: SessionId::new(session),
            payload: ExistingSessionPayload::End,
        })
    }

    fn collecting_sink() -> (ExternalEventSink, Arc<Mutex<Vec<ExternalEvent>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let inbox = Arc::clone(&received);
        let sink: ExternalEventSink = Arc::new(move |event| inbox.lock().unwrap().push(event));
        (sink, received)
    }

    #[test]
    fn deliveries_before_start_are_held_back() {
        let messaging = RecordingMessaging::new(Party::new("O=Bob"));
        messaging
            .deliver(&Party::new("O=Alice"), &end(1), "m-1")
            .unwrap();

        let (sink, received) = collecting_sink();
        assert!(received.lock().unwrap().is_empty());
        messaging.start(sink);

        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(messaging.unacknowledged(), 1);
    }

    #[test]
    fn network_delivers_to_the_recipient() {
        let network = InMemoryNetwork::new();
        let alice = network.messaging(Party::new("O=Alice"));
        let bob = network.messaging(Party::new("O=Bob"));
        let (sink, received) = collecting_sink();
        bob.start(sink);

        alice
            .send_session_message(
                &Party::new("O=Bob"),
                end(9),
                SenderDeduplicationId::new(SessionId::new(3), 0),
            )
            .unwrap();

        assert_eq!(alice.sent().len(), 1);
        let received = received.lock().unwrap();
        let [ExternalEvent::Message(event)] = received.as_slice() else {
            unreachable!("expected exactly one message, got {received:?}");
        };
        assert_eq!(event.received_message.peer, "O=Alice");
        assert_eq!(
            SessionMessage::from_bytes(&event.received_message.data).unwrap(),
            end(9)
        );
    }

    #[test]
    fn sending_to_a_stranger_fails() {
        let network = InMemoryNetwork::new();
        let alice = network.messaging(Party::new("O=Alice"));

        let result = alice.send_session_message(
            &Party::new("O=Nobody"),
            end(1),
            SenderDeduplicationId::new(SessionId::new(1), 0),
        );

        assert!(matches!(result, Err(MessagingError::SendFailed { .. })));
    }

    #[tokio::test]
    async fn wait_for_returns_once_enough_was_sent() {
        let messaging = Arc::new(RecordingMessaging::new(Party::new("O=Alice")));
        let sender = Arc::clone(&messaging);
        let task = tokio::spawn(async move {
            for sequence in 0..2 {
                sender
                    .send_session_message(
                        &Party::new("O=Bob"),
                        end(1),
                        SenderDeduplicationId::new(SessionId::new(1), sequence),
                    )
                    .unwrap();
                tokio::task::yield_now().await;
            }
        });

        let sent = messaging.wait_for(2).await;
        task.await.unwrap();
        assert_eq!(sent.len(), 2);
    }
}
