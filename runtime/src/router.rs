//! Routing of inbound external events.
//!
//! Every delivery is first checked against the set of deliveries already in
//! flight, so a redelivered message never reaches a flow twice. Session
//! messages then go to the flow owning the recipient session; initiations
//! start a responder; start requests create a flow.

use crate::hospital::Verdict;
use crate::manager::FlowStateMachineManager;
use crate::timeout::{random_jitter, timeout_delay};
use flowmachine_core::checkpoint::{Checkpoint, FlowStart};
use flowmachine_core::context::InvocationContext;
use flowmachine_core::error::{FlowError, FlowErrorKind};
use flowmachine_core::event::Event;
use flowmachine_core::external::{DeduplicationHandle, ExternalEvent, ExternalMessageEvent};
use flowmachine_core::id::{FlowId, SenderDeduplicationId, SessionId};
use flowmachine_core::identity::Party;
use flowmachine_core::session::{
    ExistingSessionMessage, ExistingSessionPayload, InitialSessionMessage, SessionMessage,
};
use std::sync::Arc;

/// What happened to a message for an existing session.
enum Delivery {
    Queued,
    UnknownSession,
    FlowGone(FlowId),
}

impl FlowStateMachineManager {
    /// Route one external event. Callers hold the external event lock.
    pub(crate) fn route(&self, event: ExternalEvent) {
        match event {
            ExternalEvent::Message(message) => {
                let handle = DeduplicationHandle::new(
                    Arc::clone(&message.deduplication_handler),
                    ExternalEvent::Message(message.clone()),
                );
                if self.is_duplicate(&handle) {
                    return;
                }
                self.on_external_message(message, handle);
            }
            ExternalEvent::StartFlow(start) => {
                let handle = start.deduplication_handler.clone().map(|handler| {
                    DeduplicationHandle::new(handler, ExternalEvent::StartFlow(start.clone()))
                });
                if handle.as_ref().is_some_and(|handle| self.is_duplicate(handle)) {
                    return;
                }
                self.on_external_start_flow(start, handle);
            }
        }
    }

    /// Mark a delivery in flight. A delivery that already is gets
    /// acknowledged and dropped.
    fn is_duplicate(&self, handle: &DeduplicationHandle) -> bool {
        let fresh = self.shared().inner.write(|inner| {
            inner
                .in_flight_deduplication
                .insert(handle.deduplication_id().clone())
        });
        if !fresh {
            tracing::debug!(
                deduplication_id = %handle.deduplication_id(),
                "Dropping duplicate of a delivery in flight"
            );
            handle.after_database_transaction();
        }
        !fresh
    }

    fn on_external_message(&self, event: ExternalMessageEvent, handle: DeduplicationHandle) {
        let peer_name = &event.received_message.peer;
        let Some(sender) = self.services().network_map.peer_by_legal_name(peer_name) else {
            tracing::error!(peer = %peer_name, "Unknown peer, discarding message");
            self.acknowledge(&[handle]);
            return;
        };
        let message = match SessionMessage::from_bytes(&event.received_message.data) {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(peer = %sender, %error, "Discarding undecodable session message");
                self.acknowledge(&[handle]);
                return;
            }
        };
        match message {
            SessionMessage::Existing(message) => self.on_existing_session_message(message, sender, handle),
            SessionMessage::Initial(message) => {
                self.on_session_init(message, sender, event, handle);
            }
        }
    }

    fn on_existing_session_message(
        &self,
        message: ExistingSessionMessage,
        sender: Party,
        handle: DeduplicationHandle,
    ) {
        let session_id = message.recipient_session_id;
        let is_end = message.payload.is_end();
        let event_handle = handle.clone();
        let delivery = self.shared().inner.read(|inner| {
            let Some(flow_id) = inner.session_to_flow.get(&session_id).copied() else {
                return Delivery::UnknownSession;
            };
            match inner.flows.get(&flow_id) {
                Some(flow) => {
                    flow.queue.push(Event::DeliverSessionMessage {
                        message,
                        deduplication_handle: event_handle,
                        sender,
                    });
                    Delivery::Queued
                }
                None => Delivery::FlowGone(flow_id),
            }
        });

        match delivery {
            Delivery::Queued => return,
            Delivery::UnknownSession if is_end => {
                tracing::debug!(session_id = %session_id, "Received session end for unknown session");
            }
            Delivery::UnknownSession => {
                tracing::info!(
                    session_id = %session_id,
                    "Cannot find flow for session, discarding message"
                );
            }
            Delivery::FlowGone(flow_id) => {
                tracing::info!(
                    session_id = %session_id,
                    flow_id = %flow_id,
                    "Flow owning session is no longer registered, discarding message"
                );
            }
        }
        self.acknowledge(&[handle]);
    }

    /// Start the responder for a peer's session initiation.
    fn on_session_init(
        &self,
        message: InitialSessionMessage,
        sender: Party,
        event: ExternalMessageEvent,
        handle: DeduplicationHandle,
    ) {
        let catalog = &self.services().catalog;
        let factory = match catalog.lookup_initiated(&message.initiator_flow_name) {
            Ok(factory) => factory,
            Err(rejection) => {
                let error = FlowError::new(FlowErrorKind::SessionRejected, rejection.to_string());
                self.session_init_failed(&message, sender, error, event, handle);
                return;
            }
        };

        let initiated_session_id = SessionId::random();
        let logic = factory.create_flow(&sender, initiated_session_id);
        let frozen_flow = match logic.freeze() {
            Ok(frozen_flow) => frozen_flow,
            Err(error) => {
                let error = FlowError::logic(format!(
                    "Cannot checkpoint responder {}: {error}",
                    logic.flow_name()
                ));
                self.session_init_failed(&message, sender, error, event, handle);
                return;
            }
        };

        let flow_start = FlowStart::Initiated {
            peer: sender.clone(),
            initiator_session_id: message.initiator_session_id,
            initiated_session_id,
            initiator_flow_name: message.initiator_flow_name,
            first_payload: message.first_payload,
            protocol: factory.protocol_info(),
        };
        let checkpoint = Checkpoint::create(
            InvocationContext::peer(sender.clone()),
            flow_start,
            frozen_flow,
            self.shared().our_identity.clone(),
            logic.is_timed(),
        );
        let flow_id = FlowId::random();
        tracing::info!(
            flow_id = %flow_id,
            peer = %sender,
            session_id = %initiated_session_id,
            flow = logic.flow_name(),
            "Starting responder flow"
        );
        self.start_flow_internal(flow_id, checkpoint, logic, vec![handle], None);
    }

    /// Hand a failed initiation to the Flow Hospital and carry out its verdict.
    fn session_init_failed(
        &self,
        message: &InitialSessionMessage,
        sender: Party,
        error: FlowError,
        event: ExternalMessageEvent,
        handle: DeduplicationHandle,
    ) {
        tracing::warn!(
            peer = %sender,
            initiator = %message.initiator_flow_name,
            %error,
            "Cannot start responder flow"
        );
        let verdict = self.hospital().session_init_errored(
            FlowId::random(),
            sender.clone(),
            error.clone(),
            event.clone(),
        );
        match verdict {
            Verdict::Terminate => {
                let reject = SessionMessage::Existing(ExistingSessionMessage {
                    recipient_session_id: message.initiator_session_id,
                    payload: ExistingSessionPayload::Reject {
                        message: error.message().to_string(),
                        error_id: error.error_id(),
                    },
                });
                let deduplication_id = SenderDeduplicationId::new(message.initiator_session_id, 0);
                if let Err(error) =
                    self.services()
                        .messaging
                        .send_session_message(&sender, reject, deduplication_id)
                {
                    tracing::warn!(peer = %sender, %error, "Failed to send session rejection");
                }
                self.acknowledge(&[handle]);
            }
            Verdict::Retry => {
                self.release(&[handle]);
                let delay = timeout_delay(&self.shared().config.flow_timeout, 0, random_jitter());
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(error) = manager.deliver_external_event(ExternalEvent::Message(event)) {
                        tracing::debug!(%error, "Not redelivering session initiation");
                    }
                });
            }
            Verdict::Observe => {
                // Kept by the hospital, unacknowledged.
                self.release(&[handle]);
            }
        }
    }
}
