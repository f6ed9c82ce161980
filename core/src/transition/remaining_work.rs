//! `DoRemainingWork`: start a flow, or finish whatever it is suspended on.

use super::TransitionResult;
use super::builder::TransitionBuilder;
use super::session;
use crate::action::Action;
use crate::checkpoint::{FlowStart, FlowState, SessionEntry, SessionState};
use crate::flow::{FlowIoRequest, FlowResume};

pub(super) fn do_remaining_work(b: TransitionBuilder) -> TransitionResult {
    if b.state.is_flow_resumed {
        return b.process_events();
    }
    match b.state.checkpoint.flow_state.clone() {
        FlowState::Unstarted { flow_start, .. } => start_flow(b, flow_start),
        FlowState::Started { pending_io, .. } => continue_io(b, pending_io),
    }
}

/// Run an unstarted flow from the beginning.
///
/// Unless starting is idempotent, the initial checkpoint is committed first so
/// the flow survives a crash before its first suspension.
fn start_flow(mut b: TransitionBuilder, flow_start: FlowStart) -> TransitionResult {
    let flow_id = b.state.flow_id;
    let mut confirmation = None;
    if let FlowStart::Initiated {
        peer,
        initiator_session_id,
        initiated_session_id,
        first_payload,
        protocol,
        ..
    } = flow_start
    {
        b.state
            .checkpoint
            .sessions
            .entry(initiated_session_id)
            .or_insert_with(|| SessionEntry {
                peer,
                state: SessionState::Initiated {
                    peer_session_id: initiator_session_id,
                    received: first_payload.into_iter().collect(),
                    ended: false,
                    error: None,
                },
                sent_count: 0,
            });
        confirmation = Some((initiated_session_id, initiator_session_id, protocol));
    }

    if !b.state.is_start_idempotent {
        b.commit_checkpoint();
    }
    if let Some((initiated_session_id, initiator_session_id, protocol)) = confirmation {
        session::confirm(&mut b, initiated_session_id, initiator_session_id, protocol);
    }
    b.push(Action::SignalFlowHasStarted { flow_id });
    b.resume(FlowResume::Start)
}

fn continue_io(mut b: TransitionBuilder, pending_io: FlowIoRequest) -> TransitionResult {
    match pending_io {
        FlowIoRequest::ForceCheckpoint => b.resume(FlowResume::Proceed),
        FlowIoRequest::Send {
            session_id,
            payload,
        } => match session::send(&mut b, session_id, payload) {
            Ok(()) => b.resume(FlowResume::Proceed),
            Err(error) => b.throw(error),
        },
        FlowIoRequest::Receive { session_id } => session::receive(b, session_id),
        FlowIoRequest::SendAndReceive {
            session_id,
            payload,
        } => {
            if let Err(error) = session::send(&mut b, session_id, payload) {
                return b.throw(error);
            }
            // The send is done; from now on only the receive is outstanding.
            if let FlowState::Started { pending_io, .. } = &mut b.state.checkpoint.flow_state {
                *pending_io = FlowIoRequest::Receive { session_id };
            }
            session::receive(b, session_id)
        }
        FlowIoRequest::CloseSessions { session_ids } => {
            session::close_sessions(&mut b, &session_ids);
            b.resume(FlowResume::Proceed)
        }
        FlowIoRequest::Sleep { until } => {
            b.push(Action::SleepUntil { until });
            b.process_events()
        }
    }
}

/// A sleep timer fired. Stale timers, from an earlier sleep or a retried
/// flow, are ignored.
pub(super) fn wake_up_from_sleep(
    b: TransitionBuilder,
    until: chrono::DateTime<chrono::Utc>,
) -> TransitionResult {
    let sleeping = matches!(
        &b.state.checkpoint.flow_state,
        FlowState::Started { pending_io: FlowIoRequest::Sleep { until: current }, .. } if *current == until
    );
    if sleeping && !b.state.is_flow_resumed {
        b.resume(FlowResume::Proceed)
    } else {
        b.process_events()
    }
}
