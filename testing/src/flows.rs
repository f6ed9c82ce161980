//! Sample flows for tests.
//!
//! Each one exercises a different part of the state machine:
//!
//! - [`PingFlow`] / [`PongFlow`]: a session initiation, a request and a reply
//! - [`CountdownFlow`]: a number of checkpoints and nothing else
//! - [`SleepyFlow`]: a sleep
//! - [`FailingFlow`]: an error from the logic
//! - [`TimedWaitFlow`]: timeout supervision
//!
//! [`sample_catalog`] registers all of them.

use flowmachine_core::catalog::{FlowCatalog, InitiatedFlowFactory};
use flowmachine_core::checkpoint::CheckpointError;
use flowmachine_core::error::{FlowError, FlowErrorKind};
use flowmachine_core::flow::{FlowContext, FlowIoRequest, FlowLogic, FlowResume, FlowStep, FrozenFlow};
use flowmachine_core::id::SessionId;
use flowmachine_core::identity::Party;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Catalog name of [`PingFlow`].
pub const PING: &str = "ping";
/// Catalog name of [`PongFlow`].
pub const PONG: &str = "pong";
/// Catalog name of [`CountdownFlow`].
pub const COUNTDOWN: &str = "countdown";
/// Catalog name of [`SleepyFlow`].
pub const SLEEPY: &str = "sleepy";
/// Catalog name of [`FailingFlow`].
pub const FAILING: &str = "failing";
/// Catalog name of [`TimedWaitFlow`].
pub const TIMED_WAIT: &str = "timed_wait";
/// A name the catalog knows that is not a flow.
pub const NOT_A_FLOW: &str = "not_a_flow";

/// Every sample flow, with [`PongFlow`] answering [`PingFlow`].
#[must_use]
pub fn sample_catalog() -> FlowCatalog {
    FlowCatalog::new()
        .with_flow::<PingFlow>(PING)
        .with_flow::<PongFlow>(PONG)
        .with_flow::<CountdownFlow>(COUNTDOWN)
        .with_flow::<SleepyFlow>(SLEEPY)
        .with_flow::<FailingFlow>(FAILING)
        .with_flow::<TimedWaitFlow>(TIMED_WAIT)
        .with_type(NOT_A_FLOW)
        .with_responder(PING, Arc::new(PongResponder))
}

fn unexpected(flow_name: &str, input: &FlowResume) -> FlowError {
    FlowError::logic(format!("{flow_name} cannot handle {input:?}"))
}

/// Sends "ping" to a peer and finishes with the reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingFlow {
    /// Not started.
    Start {
        /// Who to ping.
        peer: Party,
    },
    /// Waiting for the reply.
    AwaitingPong {
        /// The session to the peer.
        session_id: SessionId,
    },
}

impl PingFlow {
    /// Ping `peer`.
    #[must_use]
    pub const fn new(peer: Party) -> Self {
        Self::Start { peer }
    }
}

impl FlowLogic for PingFlow {
    fn flow_name(&self) -> &'static str {
        PING
    }

    fn resume(&mut self, ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match (&*self, input) {
            (_, FlowResume::Failed(error)) => Err(error),
            (Self::Start { peer }, FlowResume::Start) => {
                let session_id = ctx.initiate_flow(peer.clone());
                *self = Self::AwaitingPong { session_id };
                Ok(FlowStep::Suspend(FlowIoRequest::SendAndReceive {
                    session_id,
                    payload: b"ping".to_vec(),
                }))
            }
            (Self::AwaitingPong { .. }, FlowResume::Received { payload, .. }) => {
                FlowStep::finish(&String::from_utf8_lossy(&payload).into_owned())
            }
            (_, input) => Err(unexpected(PING, &input)),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(PING, self)
    }
}

/// Answers a ping with "pong" and finishes with what it received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PongFlow {
    /// Waiting for the ping.
    AwaitingPing {
        /// Our end of the session.
        session_id: SessionId,
    },
    /// The reply is out.
    Replied {
        /// What the initiator sent.
        received: String,
    },
}

impl PongFlow {
    /// Respond on `session_id`.
    #[must_use]
    pub const fn new(session_id: SessionId) -> Self {
        Self::AwaitingPing { session_id }
    }
}

impl FlowLogic for PongFlow {
    fn flow_name(&self) -> &'static str {
        PONG
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match (&*self, input) {
            (_, FlowResume::Failed(error)) => Err(error),
            (Self::AwaitingPing { session_id }, FlowResume::Start) => {
                Ok(FlowStep::Suspend(FlowIoRequest::Receive {
                    session_id: *session_id,
                }))
            }
            (Self::AwaitingPing { session_id }, FlowResume::Received { payload, .. }) => {
                let session_id = *session_id;
                *self = Self::Replied {
                    received: String::from_utf8_lossy(&payload).into_owned(),
                };
                Ok(FlowStep::Suspend(FlowIoRequest::Send {
                    session_id,
                    payload: b"pong".to_vec(),
                }))
            }
            (Self::Replied { received }, FlowResume::Proceed) => FlowStep::finish(received),
            (_, input) => Err(unexpected(PONG, &input)),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(PONG, self)
    }
}

/// Builds a [`PongFlow`] for every inbound ping session.
#[derive(Clone, Copy, Debug, Default)]
pub struct PongResponder;

impl InitiatedFlowFactory for PongResponder {
    fn create_flow(&self, _initiator: &Party, session_id: SessionId) -> Box<dyn FlowLogic> {
        Box::new(PongFlow::new(session_id))
    }
}

/// Checkpoints `remaining` times, then finishes with how many it took.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownFlow {
    /// Checkpoints still to take.
    pub remaining: u32,
    /// Checkpoints taken.
    pub taken: u32,
}

impl CountdownFlow {
    /// Count down from `from`.
    #[must_use]
    pub const fn new(from: u32) -> Self {
        Self {
            remaining: from,
            taken: 0,
        }
    }
}

impl FlowLogic for CountdownFlow {
    fn flow_name(&self) -> &'static str {
        COUNTDOWN
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match input {
            FlowResume::Failed(error) => Err(error),
            FlowResume::Start | FlowResume::Proceed if self.remaining == 0 => {
                FlowStep::finish(&self.taken)
            }
            FlowResume::Start | FlowResume::Proceed => {
                self.remaining -= 1;
                self.taken += 1;
                Ok(FlowStep::Suspend(FlowIoRequest::ForceCheckpoint))
            }
            input @ FlowResume::Received { .. } => Err(unexpected(COUNTDOWN, &input)),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(COUNTDOWN, self)
    }
}

/// Sleeps once, then finishes with "rested".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepyFlow {
    /// Length of the sleep.
    pub millis: u64,
    /// The sleep was requested.
    pub asleep: bool,
}

impl SleepyFlow {
    /// Sleep for `duration`.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            asleep: false,
        }
    }
}

impl FlowLogic for SleepyFlow {
    fn flow_name(&self) -> &'static str {
        SLEEPY
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match input {
            FlowResume::Failed(error) => Err(error),
            FlowResume::Start => {
                self.asleep = true;
                Ok(FlowStep::Suspend(FlowIoRequest::sleep(Duration::from_millis(
                    self.millis,
                ))))
            }
            FlowResume::Proceed if self.asleep => FlowStep::finish(&"rested".to_string()),
            input => Err(unexpected(SLEEPY, &input)),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(SLEEPY, self)
    }
}

/// What a [`FailingFlow`] fails with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// A logic error, which the Flow Hospital does not retry.
    Logic,
    /// A transient error, which it retries a bounded number of times.
    Transient,
}

/// Checkpoints once, then fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingFlow {
    /// The failure.
    pub failure: Failure,
}

impl FailingFlow {
    /// Fail with `failure`.
    #[must_use]
    pub const fn new(failure: Failure) -> Self {
        Self { failure }
    }
}

impl FlowLogic for FailingFlow {
    fn flow_name(&self) -> &'static str {
        FAILING
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match input {
            FlowResume::Failed(error) => Err(error),
            FlowResume::Start => Ok(FlowStep::Suspend(FlowIoRequest::ForceCheckpoint)),
            _ => {
                let kind = match self.failure {
                    Failure::Logic => FlowErrorKind::Logic,
                    Failure::Transient => FlowErrorKind::Transient,
                };
                Err(FlowError::new(kind, "failing flow failed"))
            }
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(FAILING, self)
    }
}

/// A timed flow that sleeps for an hour.
///
/// Nothing it waits for arrives in a test, so only the timeout scheduler moves it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedWaitFlow {
    /// Timeout to request, in seconds.
    pub custom_timeout: Option<u64>,
}

impl TimedWaitFlow {
    /// Wait under the configured timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            custom_timeout: None,
        }
    }

    /// Ask for a longer timeout than configured.
    #[must_use]
    pub const fn with_custom_timeout(mut self, seconds: u64) -> Self {
        self.custom_timeout = Some(seconds);
        self
    }
}

impl FlowLogic for TimedWaitFlow {
    fn flow_name(&self) -> &'static str {
        TIMED_WAIT
    }

    fn is_timed(&self) -> bool {
        true
    }

    fn resume(&mut self, ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match input {
            FlowResume::Failed(error) => Err(error),
            FlowResume::Start => {
                if let Some(seconds) = self.custom_timeout {
                    ctx.request_timeout(seconds);
                }
                Ok(FlowStep::Suspend(FlowIoRequest::sleep(Duration::from_secs(
                    3600,
                ))))
            }
            input => Err(unexpected(TIMED_WAIT, &input)),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(TIMED_WAIT, self)
    }
}
