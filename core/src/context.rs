//! Who started a flow, when, and the clock used to say so.

use crate::identity::Party;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused a flow to be invoked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationOrigin {
    /// Started through the node's client API.
    Rpc {
        /// Authenticated user that made the call.
        actor: String,
    },
    /// Started in response to a session-initiation message from a peer.
    Peer {
        /// The initiating party.
        party: Party,
    },
    /// Started by a service running inside the node.
    Service {
        /// Service name.
        name: String,
    },
    /// Started by the scheduler.
    Scheduled {
        /// Description of the scheduled activity.
        description: String,
    },
}

/// Context a flow was invoked in. Stored in the checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// What started the flow.
    pub origin: InvocationOrigin,
    /// Correlation id carried through logs.
    pub trace_id: Uuid,
    /// When the invocation happened.
    pub timestamp: DateTime<Utc>,
}

impl InvocationContext {
    /// Create a context with a fresh trace id.
    #[must_use]
    pub fn new(origin: InvocationOrigin, timestamp: DateTime<Utc>) -> Self {
        Self {
            origin,
            trace_id: Uuid::new_v4(),
            timestamp,
        }
    }

    /// Context for a flow started through the client API, stamped now.
    #[must_use]
    pub fn rpc(actor: impl Into<String>) -> Self {
        Self::new(
            InvocationOrigin::Rpc {
                actor: actor.into(),
            },
            Utc::now(),
        )
    }

    /// Context for a flow started by a peer, stamped now.
    #[must_use]
    pub fn peer(party: Party) -> Self {
        Self::new(InvocationOrigin::Peer { party }, Utc::now())
    }

    /// Context for a flow started by an in-process service, stamped now.
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self::new(InvocationOrigin::Service { name: name.into() }, Utc::now())
    }
}

/// Source of the current time.
///
/// Injected wherever wall-clock time ends up in observable records so tests
/// can substitute a fixed clock.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
