//! Registry of flow types: how to thaw them, and which responder answers
//! which initiating flow.

use crate::checkpoint::CheckpointError;
use crate::flow::{FlowLogic, FrozenFlow};
use crate::id::SessionId;
use crate::identity::Party;
use crate::session::ProtocolInfo;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why an inbound session initiation could not be answered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionRejectError {
    /// The initiator's flow name is not known to this node.
    #[error("Don't know {0}")]
    UnknownClass(String),

    /// The name is known, but is not a flow.
    #[error("{0} is not a flow")]
    NotAFlow(String),

    /// The flow is known, but no responder is registered for it.
    #[error("{0} is not registered as an initiating flow")]
    NotRegistered(String),
}

/// Creates the responder for sessions opened by a particular initiating flow.
pub trait InitiatedFlowFactory: Send + Sync {
    /// Build the responder logic for a session opened by `initiator`.
    ///
    /// `session_id` is the responder's own end of the session.
    fn create_flow(&self, initiator: &Party, session_id: SessionId) -> Box<dyn FlowLogic>;

    /// Protocol version reported back to the initiator.
    fn protocol_info(&self) -> ProtocolInfo {
        ProtocolInfo::default()
    }
}

impl<F> InitiatedFlowFactory for F
where
    F: Fn(&Party, SessionId) -> Box<dyn FlowLogic> + Send + Sync,
{
    fn create_flow(&self, initiator: &Party, session_id: SessionId) -> Box<dyn FlowLogic> {
        self(initiator, session_id)
    }
}

type ThawFn = Arc<dyn Fn(&FrozenFlow) -> Result<Box<dyn FlowLogic>, CheckpointError> + Send + Sync>;

/// Known flow types.
///
/// # Example
///
/// ```ignore
/// let catalog = FlowCatalog::new()
///     .with_flow::<Ping>("ping")
///     .with_flow::<Pong>("pong")
///     .with_responder("ping", Arc::new(|peer: &Party, session: SessionId| {
///         Box::new(Pong::new(peer.clone(), session)) as Box<dyn FlowLogic>
///     }));
/// ```
#[derive(Clone, Default)]
pub struct FlowCatalog {
    flows: HashMap<String, ThawFn>,
    other_types: HashSet<String>,
    responders: HashMap<String, Arc<dyn InitiatedFlowFactory>>,
}

impl FlowCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow type so its checkpoints can be thawed.
    #[must_use]
    pub fn with_flow<T>(mut self, flow_name: &str) -> Self
    where
        T: FlowLogic + DeserializeOwned,
    {
        let thaw: ThawFn = Arc::new(|frozen: &FrozenFlow| {
            frozen
                .thaw::<T>()
                .map(|logic| Box::new(logic) as Box<dyn FlowLogic>)
        });
        self.flows.insert(flow_name.to_string(), thaw);
        self
    }

    /// Register a name that is known to the node but is not a flow.
    #[must_use]
    pub fn with_type(mut self, type_name: &str) -> Self {
        self.other_types.insert(type_name.to_string());
        self
    }

    /// Register the responder for sessions opened by `initiator_flow_name`.
    #[must_use]
    pub fn with_responder(
        mut self,
        initiator_flow_name: &str,
        factory: Arc<dyn InitiatedFlowFactory>,
    ) -> Self {
        self.responders
            .insert(initiator_flow_name.to_string(), factory);
        self
    }

    /// Whether `flow_name` is a registered flow.
    #[must_use]
    pub fn is_flow(&self, flow_name: &str) -> bool {
        self.flows.contains_key(flow_name)
    }

    /// Find the responder for an initiating flow.
    ///
    /// # Errors
    ///
    /// Returns a distinct [`SessionRejectError`] for a name that is unknown,
    /// not a flow, or a flow without a responder.
    pub fn lookup_initiated(
        &self,
        initiator_flow_name: &str,
    ) -> Result<Arc<dyn InitiatedFlowFactory>, SessionRejectError> {
        if let Some(factory) = self.responders.get(initiator_flow_name) {
            return Ok(Arc::clone(factory));
        }
        if self.flows.contains_key(initiator_flow_name) {
            Err(SessionRejectError::NotRegistered(
                initiator_flow_name.to_string(),
            ))
        } else if self.other_types.contains(initiator_flow_name) {
            Err(SessionRejectError::NotAFlow(initiator_flow_name.to_string()))
        } else {
            Err(SessionRejectError::UnknownClass(
                initiator_flow_name.to_string(),
            ))
        }
    }

    /// Rebuild flow logic from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::UnknownFlow`] for an unregistered flow, or
    /// [`CheckpointError::Deserialization`] if the bytes do not decode.
    pub fn thaw(&self, frozen: &FrozenFlow) -> Result<Box<dyn FlowLogic>, CheckpointError> {
        let thaw = self
            .flows
            .get(frozen.flow_name())
            .ok_or_else(|| CheckpointError::UnknownFlow(frozen.flow_name().to_string()))?;
        thaw.as_ref()(frozen)
    }
}

impl fmt::Debug for FlowCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flows: Vec<&String> = self.flows.keys().collect();
        flows.sort();
        let mut responders: Vec<&String> = self.responders.keys().collect();
        responders.sort();
        f.debug_struct("FlowCatalog")
            .field("flows", &flows)
            .field("responders", &responders)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::error::FlowError;
    use crate::flow::{FlowContext, FlowResume, FlowStep};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        reply: Vec<u8>,
    }

    impl FlowLogic for Echo {
        fn flow_name(&self) -> &'static str {
            "echo"
        }

        fn resume(&mut self, _ctx: &mut FlowContext, _input: FlowResume) -> Result<FlowStep, FlowError> {
            Ok(FlowStep::Finish(self.reply.clone()))
        }

        fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
            FrozenFlow::freeze(self.flow_name(), self)
        }
    }

    fn catalog() -> FlowCatalog {
        FlowCatalog::new()
            .with_flow::<Echo>("echo")
            .with_flow::<Echo>("lonely")
            .with_type("payload")
            .with_responder(
                "echo",
                Arc::new(|_: &Party, _: SessionId| {
                    Box::new(Echo { reply: vec![1] }) as Box<dyn FlowLogic>
                }),
            )
    }

    #[test]
    fn lookup_distinguishes_every_rejection() {
        let catalog = catalog();
        assert!(catalog.lookup_initiated("echo").is_ok());
        assert_eq!(
            catalog.lookup_initiated("lonely").err(),
            Some(SessionRejectError::NotRegistered("lonely".to_string()))
        );
        assert_eq!(
            catalog.lookup_initiated("payload").err(),
            Some(SessionRejectError::NotAFlow("payload".to_string()))
        );
        assert_eq!(
            catalog.lookup_initiated("mystery").err(),
            Some(SessionRejectError::UnknownClass("mystery".to_string()))
        );
    }

    #[test]
    fn thaw_rebuilds_registered_flows() {
        let frozen = Echo { reply: vec![7] }.freeze().unwrap();
        let mut logic = catalog().thaw(&frozen).unwrap();
        assert_eq!(logic.flow_name(), "echo");

        let mut ctx = FlowContext::new(crate::id::FlowId::random(), Party::new("O=Alice"));
        let step = logic.resume(&mut ctx, FlowResume::Start).unwrap();
        assert_eq!(step, FlowStep::Finish(vec![7]));
    }

    #[test]
    fn thaw_rejects_unknown_flows() {
        let frozen = FrozenFlow::new("mystery", vec![]);
        assert_eq!(
            catalog().thaw(&frozen).err(),
            Some(CheckpointError::UnknownFlow("mystery".to_string()))
        );
    }
}
