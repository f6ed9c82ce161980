//! The manager's shared registries, behind one guard.
//!
//! Flows, session bindings, timers and the change feed publisher are only
//! ever touched through [`ConcurrentBox`], so multi-step updates such as
//! "remove the flow, unbind its sessions, publish the removal" happen as one
//! unit and a `track()` caller can never observe half of one.

use crate::event_queue::EventQueue;
use flowmachine_core::external::{FlowHandle, FlowResult, StartFlowReply};
use flowmachine_core::id::{DeduplicationId, FlowId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Exclusive-or-shared access to a value, only through closures.
#[derive(Debug)]
pub(crate) struct ConcurrentBox<T> {
    inner: RwLock<T>,
}

impl<T> ConcurrentBox<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Run `f` with shared access.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run `f` with exclusive access.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A registered flow, as the manager sees it.
#[derive(Debug)]
pub(crate) struct Flow {
    pub(crate) flow_name: String,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) task: Option<AbortHandle>,
    /// Taken when the flow is removed.
    pub(crate) result: Option<oneshot::Sender<FlowResult>>,
    /// Sent to the starter once the flow has begun executing.
    pub(crate) pending_start: Option<(StartFlowReply, FlowHandle)>,
}

impl Flow {
    pub(crate) fn info(&self, id: FlowId) -> FlowInfo {
        FlowInfo {
            id,
            flow_name: self.flow_name.clone(),
        }
    }
}

/// Public summary of a registered flow.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowInfo {
    /// The flow's id.
    pub id: FlowId,
    /// Name of the flow's root logic.
    pub flow_name: String,
}

/// An entry of the change feed.
#[derive(Clone, Debug)]
pub enum Change {
    /// A flow was registered.
    Add(FlowInfo),
    /// A flow left the registry with this outcome.
    Removed(FlowInfo, FlowResult),
}

impl Change {
    /// The flow the change is about.
    #[must_use]
    pub const fn flow(&self) -> &FlowInfo {
        match self {
            Self::Add(info) | Self::Removed(info, _) => info,
        }
    }
}

/// Timer of a flow under timeout supervision.
#[derive(Debug)]
pub(crate) struct ScheduledTimeout {
    pub(crate) timer: AbortHandle,
    pub(crate) retry_count: u32,
}

#[derive(Debug)]
pub(crate) struct InnerState {
    pub(crate) flows: HashMap<FlowId, Flow>,
    pub(crate) session_to_flow: HashMap<SessionId, FlowId>,
    pub(crate) timed_flows: HashMap<FlowId, ScheduledTimeout>,
    /// Deliveries routed to a flow and not yet acknowledged.
    pub(crate) in_flight_deduplication: HashSet<DeduplicationId>,
    /// One unbounded queue per `track()` caller, so a slow reader never
    /// loses a change.
    pub(crate) subscribers: Vec<mpsc::UnboundedSender<Change>>,
    /// Set by `stop`; flows registered afterwards are told to shut down.
    pub(crate) stopping: bool,
}

impl InnerState {
    pub(crate) fn new() -> Self {
        Self {
            flows: HashMap::new(),
            session_to_flow: HashMap::new(),
            timed_flows: HashMap::new(),
            in_flight_deduplication: HashSet::new(),
            subscribers: Vec::new(),
            stopping: false,
        }
    }

    /// Register a change feed. Call under the same guard as the snapshot.
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Change> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    /// Publish a change to every live feed, dropping feeds whose receiver is
    /// gone. Nobody listening is fine.
    pub(crate) fn publish(&mut self, change: Change) {
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }

    /// Unbind every session routed to `flow_id`.
    pub(crate) fn unbind_flow(&mut self, flow_id: FlowId) {
        self.session_to_flow.retain(|_, bound| *bound != flow_id);
    }

    /// Stop and forget the flow's timer.
    pub(crate) fn cancel_timeout(&mut self, flow_id: FlowId) -> Option<ScheduledTimeout> {
        let scheduled = self.timed_flows.remove(&flow_id)?;
        scheduled.timer.abort();
        Some(scheduled)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use flowmachine_core::error::FlowError;

    fn flow() -> Flow {
        Flow {
            flow_name: "ping".to_string(),
            queue: Arc::new(EventQueue::new()),
            task: None,
            result: None,
            pending_start: None,
        }
    }

    #[test]
    fn unbind_flow_only_touches_that_flow() {
        let mut inner = InnerState::new();
        let a = FlowId::random();
        let b = FlowId::random();
        inner.session_to_flow.insert(SessionId::new(1), a);
        inner.session_to_flow.insert(SessionId::new(2), b);
        inner.session_to_flow.insert(SessionId::new(3), a);

        inner.unbind_flow(a);
        assert_eq!(inner.session_to_flow.len(), 1);
        assert_eq!(inner.session_to_flow.get(&SessionId::new(2)), Some(&b));
    }

    #[test]
    fn changes_reach_subscribers_taken_under_the_same_guard() {
        let state = ConcurrentBox::new(InnerState::new());
        let id = FlowId::random();
        let mut changes = state.write(|inner| {
            inner.flows.insert(id, flow());
            inner.subscribe()
        });
        state.write(|inner| {
            let removed = inner.flows.remove(&id).unwrap();
            inner.publish(Change::Removed(removed.info(id), Err(FlowError::killed())));
        });

        let change = changes.try_recv().unwrap();
        assert_eq!(change.flow().id, id);
        assert!(matches!(change, Change::Removed(_, Err(_))));
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let mut inner = InnerState::new();
        inner.publish(Change::Add(FlowInfo {
            id: FlowId::random(),
            flow_name: "ping".to_string(),
        }));
    }

    #[test]
    fn slow_readers_see_every_change() {
        let mut inner = InnerState::new();
        let mut changes = inner.subscribe();
        let ids: Vec<FlowId> = (0..1000).map(|_| FlowId::random()).collect();
        for id in &ids {
            inner.publish(Change::Add(FlowInfo {
                id: *id,
                flow_name: "ping".to_string(),
            }));
        }

        for id in &ids {
            assert_eq!(changes.try_recv().unwrap().flow().id, *id);
        }
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn dropped_feeds_are_forgotten() {
        let mut inner = InnerState::new();
        let kept = inner.subscribe();
        drop(inner.subscribe());

        inner.publish(Change::Add(FlowInfo {
            id: FlowId::random(),
            flow_name: "ping".to_string(),
        }));
        assert_eq!(inner.subscribers.len(), 1);
        drop(kept);
    }
}
