//! Session handling: initiation, sends, receives and inbound messages.

use super::TransitionResult;
use super::builder::TransitionBuilder;
use crate::action::{Action, Actions};
use crate::checkpoint::{SessionEntry, SessionState};
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::external::DeduplicationHandle;
use crate::flow::FlowResume;
use crate::id::{SenderDeduplicationId, SessionId};
use crate::identity::Party;
use crate::session::{
    ExistingSessionMessage, ExistingSessionPayload, InitialSessionMessage, ProtocolInfo,
};
use std::collections::VecDeque;

/// Record a session opened by the logic and start routing it to the flow.
pub(super) fn initiate_flow(
    mut b: TransitionBuilder,
    peer: Party,
    session_id: SessionId,
) -> TransitionResult {
    if b.state.checkpoint.sessions.contains_key(&session_id) {
        let error = b.internal_error(format!("Session {session_id} already exists"));
        return b.fresh_error(error);
    }
    b.state
        .checkpoint
        .sessions
        .insert(session_id, SessionEntry::uninitiated(peer));
    let flow_id = b.state.flow_id;
    b.push(Action::AddSessionBinding {
        flow_id,
        session_id,
    });
    b.process_events()
}

/// Send the initial message of an uninitiated session.
fn send_initial(
    actions: &mut Actions,
    session_id: SessionId,
    entry: &mut SessionEntry,
    initiator_flow_name: String,
    first_payload: Option<Vec<u8>>,
) {
    actions.push(Action::SendInitial {
        party: entry.peer.clone(),
        message: InitialSessionMessage {
            initiator_session_id: session_id,
            initiator_flow_name,
            protocol: ProtocolInfo::default(),
            first_payload,
        },
        deduplication_id: SenderDeduplicationId::new(session_id, entry.sent_count),
    });
    entry.sent_count += 1;
    entry.state = SessionState::Initiating {
        buffered_sends: Vec::new(),
        rejection: None,
    };
}

fn send_existing(
    actions: &mut Actions,
    session_id: SessionId,
    entry: &mut SessionEntry,
    recipient_session_id: SessionId,
    payload: ExistingSessionPayload,
) {
    actions.push(Action::SendExisting {
        party: entry.peer.clone(),
        message: ExistingSessionMessage {
            recipient_session_id,
            payload,
        },
        deduplication_id: SenderDeduplicationId::new(session_id, entry.sent_count),
    });
    entry.sent_count += 1;
}

/// Send `payload` on a session, initiating it first if needed.
///
/// Sends on a session still waiting for its confirmation are buffered and go
/// out once it arrives.
pub(super) fn send(
    b: &mut TransitionBuilder,
    session_id: SessionId,
    payload: Vec<u8>,
) -> Result<(), FlowError> {
    let initiator_flow_name = b.state.checkpoint.current_flow_name().to_string();
    let Some(entry) = b.state.checkpoint.sessions.get_mut(&session_id) else {
        return Err(b.internal_error(format!("Unknown session {session_id}")));
    };
    match &mut entry.state {
        SessionState::Uninitiated => {}
        SessionState::Initiating {
            rejection: Some(error),
            ..
        } => return Err(error.clone()),
        SessionState::Initiating { buffered_sends, .. } => {
            buffered_sends.push(payload);
            return Ok(());
        }
        SessionState::Initiated {
            error: Some(error), ..
        } => return Err(error.clone()),
        SessionState::Initiated {
            peer_session_id, ..
        } => {
            let recipient = *peer_session_id;
            send_existing(
                &mut b.actions,
                session_id,
                entry,
                recipient,
                ExistingSessionPayload::Data(payload),
            );
            return Ok(());
        }
    }
    send_initial(
        &mut b.actions,
        session_id,
        entry,
        initiator_flow_name,
        Some(payload),
    );
    Ok(())
}

/// Hand the next message of a session to the logic, if one is there.
pub(super) fn receive(mut b: TransitionBuilder, session_id: SessionId) -> TransitionResult {
    let initiator_flow_name = b.state.checkpoint.current_flow_name().to_string();
    let error_id = b.internal_error_id();
    let Some(entry) = b.state.checkpoint.sessions.get_mut(&session_id) else {
        let error = b.internal_error(format!("Unknown session {session_id}"));
        return b.throw(error);
    };

    if matches!(entry.state, SessionState::Uninitiated) {
        send_initial(&mut b.actions, session_id, entry, initiator_flow_name, None);
        return b.process_events();
    }

    let outcome = match &mut entry.state {
        SessionState::Initiating {
            rejection: Some(error),
            ..
        } => Some(Err(error.clone())),
        SessionState::Uninitiated | SessionState::Initiating { .. } => None,
        SessionState::Initiated {
            received,
            ended,
            error,
            ..
        } => {
            if let Some(payload) = received.pop_front() {
                Some(Ok(payload))
            } else if let Some(error) = error {
                Some(Err(error.clone()))
            } else if *ended {
                Some(Err(FlowError::with_id(
                    FlowErrorKind::SessionEnded,
                    format!("{} has ended session {session_id}", entry.peer),
                    error_id,
                )))
            } else {
                None
            }
        }
    };

    match outcome {
        Some(Ok(payload)) => b.resume(FlowResume::Received {
            session_id,
            payload,
        }),
        Some(Err(error)) => b.throw(error),
        None => b.process_events(),
    }
}

/// Send `End` on each listed session and forget them.
pub(super) fn close_sessions(b: &mut TransitionBuilder, session_ids: &[SessionId]) {
    let mut removed = Vec::with_capacity(session_ids.len());
    for session_id in session_ids {
        let Some(mut entry) = b.state.checkpoint.sessions.remove(session_id) else {
            continue;
        };
        end_session(&mut b.actions, *session_id, &mut entry);
        removed.push(*session_id);
    }
    if !removed.is_empty() {
        b.push(Action::RemoveSessionBindings {
            session_ids: removed,
        });
    }
}

/// Send `End` on every open session and stop routing all of them.
pub(super) fn end_all_sessions(b: &mut TransitionBuilder) {
    let session_ids = b.state.checkpoint.session_ids();
    for (session_id, entry) in &mut b.state.checkpoint.sessions {
        end_session(&mut b.actions, *session_id, entry);
    }
    if !session_ids.is_empty() {
        b.push(Action::RemoveSessionBindings { session_ids });
    }
}

fn end_session(actions: &mut Actions, session_id: SessionId, entry: &mut SessionEntry) {
    if let SessionState::Initiated {
        peer_session_id,
        ended: false,
        error: None,
        ..
    } = entry.state
    {
        send_existing(
            actions,
            session_id,
            entry,
            peer_session_id,
            ExistingSessionPayload::End,
        );
    }
}

/// Confirm an initiated flow's session to its initiator.
pub(super) fn confirm(
    b: &mut TransitionBuilder,
    initiated_session_id: SessionId,
    initiator_session_id: SessionId,
    protocol: ProtocolInfo,
) {
    if let Some(entry) = b.state.checkpoint.sessions.get_mut(&initiated_session_id) {
        send_existing(
            &mut b.actions,
            initiated_session_id,
            entry,
            initiator_session_id,
            ExistingSessionPayload::Confirm {
                initiated_session_id,
                protocol,
            },
        );
    }
}

/// Apply an inbound message to its session.
///
/// The delivery stays pending until the next checkpoint. A flow that is not
/// running is woken to see whether the message lets it continue.
pub(super) fn deliver_session_message(
    mut b: TransitionBuilder,
    message: ExistingSessionMessage,
    deduplication_handle: DeduplicationHandle,
    sender: &Party,
) -> TransitionResult {
    b.state
        .pending_deduplication_handlers
        .push(deduplication_handle);

    let session_id = message.recipient_session_id;
    let flow_id = b.state.flow_id;
    match b.state.checkpoint.sessions.get_mut(&session_id) {
        Some(entry) if entry.peer == *sender => {
            apply_payload(&mut b.actions, session_id, entry, message.payload);
        }
        Some(entry) => {
            tracing::warn!(
                %flow_id,
                %session_id,
                expected = %entry.peer,
                actual = %sender,
                "Dropping session message from unexpected sender"
            );
        }
        None => {
            tracing::debug!(%flow_id, %session_id, "Dropping message for closed session");
        }
    }

    if !b.state.is_flow_resumed {
        b.push(Action::ScheduleEvent(Event::DoRemainingWork));
    }
    b.process_events()
}

fn apply_payload(
    actions: &mut Actions,
    session_id: SessionId,
    entry: &mut SessionEntry,
    payload: ExistingSessionPayload,
) {
    match payload {
        ExistingSessionPayload::Confirm {
            initiated_session_id,
            ..
        } => {
            let SessionState::Initiating {
                buffered_sends,
                rejection: None,
            } = &mut entry.state
            else {
                return ignore(session_id, "Confirm", &entry.state);
            };
            let buffered = std::mem::take(buffered_sends);
            entry.state = SessionState::Initiated {
                peer_session_id: initiated_session_id,
                received: VecDeque::new(),
                ended: false,
                error: None,
            };
            for payload in buffered {
                send_existing(
                    actions,
                    session_id,
                    entry,
                    initiated_session_id,
                    ExistingSessionPayload::Data(payload),
                );
            }
        }
        ExistingSessionPayload::Data(bytes) => match &mut entry.state {
            SessionState::Initiated { received, .. } => received.push_back(bytes),
            state => ignore(session_id, "Data", state),
        },
        ExistingSessionPayload::Reject { message, error_id } => match &mut entry.state {
            SessionState::Initiating { rejection, .. } => {
                *rejection = Some(FlowError::with_id(
                    FlowErrorKind::SessionRejected,
                    message,
                    error_id,
                ));
            }
            state => ignore(session_id, "Reject", state),
        },
        ExistingSessionPayload::Error(error) => match &mut entry.state {
            SessionState::Initiated { error: slot, .. }
            | SessionState::Initiating {
                rejection: slot, ..
            } => {
                // first error wins
                if slot.is_none() {
                    *slot = Some(error.as_counterparty_error());
                }
            }
            state => ignore(session_id, "Error", state),
        },
        ExistingSessionPayload::End => match &mut entry.state {
            SessionState::Initiated { ended, .. } => *ended = true,
            state => ignore(session_id, "End", state),
        },
    }
}

fn ignore(session_id: SessionId, payload: &str, state: &SessionState) {
    tracing::debug!(
        %session_id,
        payload,
        ?state,
        "Ignoring session message that does not fit the session state"
    );
}
