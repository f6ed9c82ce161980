//! Transitions of a flow that has errors recorded against it.
//!
//! An errored flow stays parked until the Flow Hospital either retries it or
//! starts propagation. Propagation tells every counterparty, removes the
//! checkpoint and removes the flow.

use super::TransitionResult;
use super::builder::TransitionBuilder;
use super::lifecycle;
use crate::action::{Action, ErrorRecipient, FlowRemovalReason};
use crate::checkpoint::{ErrorState, SessionState};
use crate::event::Event;
use crate::id::SenderDeduplicationId;

pub(super) fn start_error_propagation(mut b: TransitionBuilder) -> TransitionResult {
    if let ErrorState::Errored { propagating, .. } = &mut b.state.checkpoint.error_state {
        *propagating = true;
        b.push(Action::ScheduleEvent(Event::DoRemainingWork));
    }
    b.process_events()
}

pub(super) fn do_remaining_work(mut b: TransitionBuilder) -> TransitionResult {
    let ErrorState::Errored {
        errors,
        propagated_index,
        propagating: true,
    } = &mut b.state.checkpoint.error_state
    else {
        return b.process_events();
    };
    let unpropagated = errors.get(*propagated_index..).map(<[_]>::to_vec).unwrap_or_default();
    *propagated_index = errors.len();
    let all_errors = errors.clone();

    let mut recipients = Vec::new();
    for (session_id, entry) in &mut b.state.checkpoint.sessions {
        if let SessionState::Initiated {
            peer_session_id,
            ended: false,
            error: None,
            ..
        } = entry.state
        {
            recipients.push(ErrorRecipient {
                party: entry.peer.clone(),
                peer_session_id,
                deduplication_id: SenderDeduplicationId::new(*session_id, entry.sent_count),
            });
            entry.sent_count += unpropagated.len() as u64;
        }
    }

    b.commit_removal();
    if !unpropagated.is_empty() && !recipients.is_empty() {
        b.push(Action::PropagateErrors {
            errors: unpropagated,
            recipients,
        });
    }
    let session_ids = b.state.checkpoint.session_ids();
    if !session_ids.is_empty() {
        b.push(Action::RemoveSessionBindings { session_ids });
    }
    lifecycle::remove(b, FlowRemovalReason::ErrorFinish(all_errors))
}
