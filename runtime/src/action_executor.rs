//! Executes the actions of a transition, in order.
//!
//! Checkpoint writes and deduplication facts are staged between
//! `CreateTransaction` and `CommitTransaction` and only reach the store at
//! commit. Messages are acknowledged by separate actions placed after the
//! commit, so a crash in between redelivers them instead of losing them.

use crate::error::ActionError;
use crate::metrics::CheckpointMetrics;
use crate::transition_executor::TransitionContext;
use chrono::Utc;
use flowmachine_core::action::{Action, Actions, ErrorRecipient};
use flowmachine_core::checkpoint::SerializedCheckpoint;
use flowmachine_core::error::FlowError;
use flowmachine_core::event::Event;
use flowmachine_core::external::DeduplicationHandle;
use flowmachine_core::id::{FlowId, SenderDeduplicationId};
use flowmachine_core::session::{ExistingSessionMessage, ExistingSessionPayload, SessionMessage};
use std::sync::Arc;

#[derive(Debug)]
enum StagedWrite {
    Put(FlowId, SerializedCheckpoint),
    Remove(FlowId),
}

/// Writes waiting for `CommitTransaction`.
#[derive(Debug, Default)]
struct Transaction {
    writes: Vec<StagedWrite>,
    deduplication: Vec<DeduplicationHandle>,
}

/// Runs action lists against the manager's collaborators.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ActionExecutor;

impl ActionExecutor {
    /// Execute `actions` in order, stopping at the first failure.
    ///
    /// Staged writes of an unfinished transaction are discarded on failure.
    pub(crate) async fn execute_all(
        self,
        ctx: &TransitionContext<'_>,
        actions: Actions,
    ) -> Result<(), ActionError> {
        let mut transaction = None;
        for action in actions {
            self.execute(ctx, &mut transaction, action).await?;
        }
        if transaction.is_some() {
            tracing::warn!(flow_id = %ctx.flow_id, "Transaction left open by transition, discarding");
        }
        Ok(())
    }

    async fn execute(
        self,
        ctx: &TransitionContext<'_>,
        transaction: &mut Option<Transaction>,
        action: Action,
    ) -> Result<(), ActionError> {
        let manager = ctx.manager;
        match action {
            Action::CreateTransaction => {
                if transaction.replace(Transaction::default()).is_some() {
                    tracing::warn!(flow_id = %ctx.flow_id, "Nested transaction, discarding the outer one");
                }
            }
            Action::PersistCheckpoint {
                flow_id,
                checkpoint,
                ..
            } => {
                let serialized = checkpoint.serialize()?;
                open(transaction, "PersistCheckpoint")?
                    .writes
                    .push(StagedWrite::Put(flow_id, serialized));
            }
            Action::RemoveCheckpoint { flow_id } => {
                open(transaction, "RemoveCheckpoint")?
                    .writes
                    .push(StagedWrite::Remove(flow_id));
            }
            Action::PersistDeduplicationFacts { handles } => {
                open(transaction, "PersistDeduplicationFacts")?
                    .deduplication
                    .extend(handles);
            }
            Action::CommitTransaction => {
                let staged = transaction
                    .take()
                    .ok_or(ActionError::NoTransaction("CommitTransaction"))?;
                self.commit(ctx, staged).await?;
            }
            Action::RollbackTransaction => {
                *transaction = None;
            }
            Action::AcknowledgeMessages { handles } => manager.acknowledge(&handles),
            Action::SignalFlowHasStarted { flow_id } => manager.signal_flow_has_started(flow_id),
            Action::SendInitial {
                party,
                message,
                deduplication_id,
            } => manager.services().messaging.send_session_message(
                &party,
                SessionMessage::Initial(message),
                deduplication_id,
            )?,
            Action::SendExisting {
                party,
                message,
                deduplication_id,
            } => manager.services().messaging.send_session_message(
                &party,
                SessionMessage::Existing(message),
                deduplication_id,
            )?,
            Action::PropagateErrors { errors, recipients } => {
                self.propagate_errors(ctx, &errors, &recipients)?;
            }
            Action::ScheduleEvent(event) => ctx.queue.push(event),
            Action::SleepUntil { until } => {
                let delay = (until - Utc::now()).to_std().unwrap_or_default();
                let queue = Arc::clone(ctx.queue);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.push(Event::WakeUpFromSleep { until });
                });
            }
            Action::ScheduleFlowTimeout { flow_id } => manager.schedule_flow_timeout(flow_id),
            Action::CancelFlowTimeout { flow_id } => manager.cancel_flow_timeout(flow_id),
            Action::AddSessionBinding {
                flow_id,
                session_id,
            } => manager.add_session_binding(flow_id, session_id)?,
            Action::RemoveSessionBindings { session_ids } => {
                manager.remove_session_bindings(&session_ids);
            }
            Action::RemoveFlow {
                flow_id,
                reason,
                last_state,
            } => manager.remove_flow(flow_id, reason, &last_state)?,
            Action::RetryFlowFromSafePoint { current_state } => {
                manager.retry_flow_from_safe_point(*current_state).await;
            }
        }
        Ok(())
    }

    async fn commit(self, ctx: &TransitionContext<'_>, staged: Transaction) -> Result<(), ActionError> {
        let store = &ctx.manager.services().checkpoint_store;
        for write in staged.writes {
            match write {
                StagedWrite::Put(flow_id, checkpoint) => {
                    store.put(flow_id, checkpoint).await?;
                    CheckpointMetrics::record_write();
                }
                StagedWrite::Remove(flow_id) => {
                    store.remove(flow_id).await?;
                    CheckpointMetrics::record_remove();
                }
            }
        }
        for handle in &staged.deduplication {
            handle.inside_database_transaction();
        }
        Ok(())
    }

    fn propagate_errors(
        self,
        ctx: &TransitionContext<'_>,
        errors: &[FlowError],
        recipients: &[ErrorRecipient],
    ) -> Result<(), ActionError> {
        let messaging = &ctx.manager.services().messaging;
        for recipient in recipients {
            for (offset, error) in (0u64..).zip(errors) {
                let message = SessionMessage::Existing(ExistingSessionMessage {
                    recipient_session_id: recipient.peer_session_id,
                    payload: ExistingSessionPayload::Error(error.clone()),
                });
                let deduplication_id = SenderDeduplicationId::new(
                    recipient.deduplication_id.session_id,
                    recipient.deduplication_id.sequence + offset,
                );
                messaging.send_session_message(&recipient.party, message, deduplication_id)?;
            }
        }
        Ok(())
    }
}

fn open<'a>(
    transaction: &'a mut Option<Transaction>,
    action: &'static str,
) -> Result<&'a mut Transaction, ActionError> {
    transaction.as_mut().ok_or(ActionError::NoTransaction(action))
}
