//! Integration tests for inbound message routing
//!
//! Covers responder start-up, deduplication of redeliveries, rejected
//! session initiations, and a full ping-pong between two nodes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowmachine_core::catalog::FlowCatalog;
use flowmachine_core::checkpoint::CheckpointError;
use flowmachine_core::context::InvocationContext;
use flowmachine_core::error::FlowError;
use flowmachine_core::flow::{
    FlowContext, FlowIoRequest, FlowLogic, FlowResume, FlowStep, FrozenFlow,
};
use flowmachine_core::id::{SenderDeduplicationId, SessionId};
use flowmachine_core::identity::Party;
use flowmachine_core::session::{
    ExistingSessionMessage, ExistingSessionPayload, InitialSessionMessage, ProtocolInfo,
    SessionMessage,
};
use flowmachine_runtime::{FlowStateMachineManager, StateMachineConfig, StateMachineServices};
use flowmachine_testing::flows::{sample_catalog, PingFlow, NOT_A_FLOW, PING, PONG};
use flowmachine_testing::helpers::init_tracing;
use flowmachine_testing::{
    test_clock, InMemoryCheckpointStore, InMemoryNetwork, InMemoryNetworkMap,
    RecordingMessaging,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const ALICE: &str = "O=Alice";
const BOB: &str = "O=Bob";

struct Node {
    manager: FlowStateMachineManager,
    store: InMemoryCheckpointStore,
    messaging: Arc<RecordingMessaging>,
}

/// A started node sending through `messaging`, ready for inbound delivery.
async fn start_node(messaging: Arc<RecordingMessaging>) -> Node {
    start_node_with(messaging, sample_catalog()).await
}

async fn start_node_with(messaging: Arc<RecordingMessaging>, catalog: FlowCatalog) -> Node {
    let store = InMemoryCheckpointStore::new();
    let network_map = InMemoryNetworkMap::new()
        .with_peer(Party::new(ALICE))
        .with_peer(Party::new(BOB));
    let services = StateMachineServices {
        checkpoint_store: Arc::new(store.clone()),
        messaging: messaging.clone(),
        network_map: Arc::new(network_map),
        catalog: Arc::new(catalog),
        clock: Arc::new(test_clock()),
    };
    let manager = FlowStateMachineManager::new(
        StateMachineConfig::default(),
        messaging.party().clone(),
        services,
    );
    manager.start(std::future::ready(())).await.unwrap();
    while !messaging.is_started() {
        tokio::task::yield_now().await;
    }
    Node {
        manager,
        store,
        messaging,
    }
}

async fn bob() -> Node {
    start_node(Arc::new(RecordingMessaging::new(Party::new(BOB)))).await
}

fn initiation(initiator_flow_name: &str, initiator_session_id: u64) -> SessionMessage {
    SessionMessage::Initial(InitialSessionMessage {
        initiator_session_id: SessionId::new(initiator_session_id),
        initiator_flow_name: initiator_flow_name.to_string(),
        protocol: ProtocolInfo::default(),
        first_payload: Some(b"ping".to_vec()),
    })
}

fn existing(recipient_session_id: u64, payload: ExistingSessionPayload) -> SessionMessage {
    SessionMessage::Existing(ExistingSessionMessage {
        recipient_session_id: SessionId::new(recipient_session_id),
        payload,
    })
}

/// Poll `condition` until it holds, failing after five seconds.
async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold within five seconds");
}

// ============================================================================
// Responders
// ============================================================================

#[tokio::test]
async fn initiations_start_a_responder_that_confirms_and_replies() {
    let bob = bob().await;

    let delivery = bob
        .messaging
        .deliver(&Party::new(ALICE), &initiation(PING, 7), "alice-1")
        .unwrap();

    let sent = bob.messaging.wait_for(2).await;
    let SessionMessage::Existing(confirm) = &sent[0].message else {
        panic!("expected a confirmation first, got {:?}", sent[0].message);
    };
    assert_eq!(sent[0].party, Party::new(ALICE));
    assert_eq!(confirm.recipient_session_id, SessionId::new(7));
    assert!(matches!(
        confirm.payload,
        ExistingSessionPayload::Confirm { .. }
    ));
    assert_eq!(
        sent[1].message,
        existing(7, ExistingSessionPayload::Data(b"pong".to_vec()))
    );

    eventually(|| delivery.acks() == 1).await;
    eventually(|| bob.manager.snapshot().is_empty()).await;
    assert!(bob.store.is_empty());
}

#[tokio::test]
async fn redeliveries_in_flight_are_dropped() {
    let bob = bob().await;
    let alice = Party::new(ALICE);

    // Both arrive before the responder ran, so the first is still in flight.
    let first = bob
        .messaging
        .deliver(&alice, &initiation(PING, 7), "alice-1")
        .unwrap();
    let second = bob
        .messaging
        .deliver(&alice, &initiation(PING, 7), "alice-1")
        .unwrap();

    assert_eq!(second.acks(), 1);
    assert_eq!(first.acks(), 0);
    assert_eq!(bob.manager.snapshot().len(), 1);

    eventually(|| first.acks() == 1).await;
    let confirmations = bob
        .messaging
        .sent()
        .iter()
        .filter(|sent| {
            matches!(
                &sent.message,
                SessionMessage::Existing(ExistingSessionMessage {
                    payload: ExistingSessionPayload::Confirm { .. },
                    ..
                })
            )
        })
        .count();
    assert_eq!(confirmations, 1);
}

// ============================================================================
// Retries
// ============================================================================

const COLLECTOR: &str = "collector";

/// Sleeps, then receives `expected` messages and sends them back joined.
#[derive(Debug, Serialize, Deserialize)]
struct Collector {
    session_id: SessionId,
    expected: usize,
    received: Vec<String>,
}

impl FlowLogic for Collector {
    fn flow_name(&self) -> &'static str {
        COLLECTOR
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        let receive = FlowIoRequest::Receive {
            session_id: self.session_id,
        };
        match input {
            FlowResume::Failed(error) => Err(error),
            FlowResume::Start => Ok(FlowStep::Suspend(FlowIoRequest::sleep(
                Duration::from_secs(3600),
            ))),
            FlowResume::Proceed if self.received.len() < self.expected => {
                Ok(FlowStep::Suspend(receive))
            }
            FlowResume::Proceed => FlowStep::finish(&self.received.len()),
            FlowResume::Received { payload, .. } => {
                self.received.push(String::from_utf8(payload).unwrap());
                if self.received.len() < self.expected {
                    return Ok(FlowStep::Suspend(receive));
                }
                Ok(FlowStep::Suspend(FlowIoRequest::Send {
                    session_id: self.session_id,
                    payload: self.received.join(",").into_bytes(),
                }))
            }
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze(COLLECTOR, self)
    }
}

fn collector_catalog() -> FlowCatalog {
    FlowCatalog::new().with_flow::<Collector>(COLLECTOR).with_responder(
        COLLECTOR,
        Arc::new(|_: &Party, session_id: SessionId| {
            Box::new(Collector {
                session_id,
                expected: 3,
                received: Vec::new(),
            }) as Box<dyn FlowLogic>
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn retried_flows_receive_unacknowledged_messages_in_arrival_order() {
    let bob = start_node_with(
        Arc::new(RecordingMessaging::new(Party::new(BOB))),
        collector_catalog(),
    )
    .await;
    let alice = Party::new(ALICE);
    let mut start = initiation(COLLECTOR, 7);
    if let SessionMessage::Initial(initial) = &mut start {
        initial.first_payload = None;
    }
    bob.messaging.deliver(&alice, &start, "init").unwrap();

    let sent = bob.messaging.wait_for(1).await;
    let SessionMessage::Existing(ExistingSessionMessage {
        payload: ExistingSessionPayload::Confirm {
            initiated_session_id,
            ..
        },
        ..
    }) = &sent[0].message
    else {
        panic!("expected a confirmation, got {:?}", sent[0].message);
    };
    let flow_id = bob.manager.snapshot()[0].id;

    // The flow is asleep, so none of these is acknowledged before the retry.
    let data = |payload: &str| {
        SessionMessage::Existing(ExistingSessionMessage {
            recipient_session_id: *initiated_session_id,
            payload: ExistingSessionPayload::Data(payload.as_bytes().to_vec()),
        })
    };
    let one = bob.messaging.deliver(&alice, &data("one"), "one").unwrap();
    let two = bob.messaging.deliver(&alice, &data("two"), "two").unwrap();
    assert!(bob.manager.retry_flow(flow_id));
    let three = bob.messaging.deliver(&alice, &data("three"), "three").unwrap();

    let sent = bob.messaging.wait_for(2).await;
    assert_eq!(
        sent[1].message,
        existing(7, ExistingSessionPayload::Data(b"one,two,three".to_vec()))
    );

    eventually(|| one.acks() == 1 && two.acks() == 1 && three.acks() == 1).await;
    eventually(|| bob.manager.snapshot().is_empty()).await;
    assert!(bob.store.is_empty());
}

// ============================================================================
// Rejections and discards
// ============================================================================

#[tokio::test]
async fn initiations_without_a_responder_are_rejected() {
    init_tracing();
    let bob = bob().await;
    let alice = Party::new(ALICE);

    for (sequence, flow_name) in ["unknown", NOT_A_FLOW, PONG].into_iter().enumerate() {
        let session = 100 + u64::try_from(sequence).unwrap();
        let delivery = bob
            .messaging
            .deliver(&alice, &initiation(flow_name, session), &format!("init-{sequence}"))
            .unwrap();

        let sent = bob.messaging.wait_for(sequence + 1).await;
        let reject = &sent[sequence];
        assert_eq!(reject.party, alice);
        assert_eq!(
            reject.deduplication_id,
            SenderDeduplicationId::new(SessionId::new(session), 0)
        );
        let SessionMessage::Existing(message) = &reject.message else {
            panic!("expected a rejection, got {:?}", reject.message);
        };
        assert_eq!(message.recipient_session_id, SessionId::new(session));
        assert!(matches!(
            message.payload,
            ExistingSessionPayload::Reject { .. }
        ));
        assert_eq!(delivery.acks(), 1, "{flow_name} initiation was not acknowledged");
    }
    assert!(bob.manager.snapshot().is_empty());
    assert!(bob.manager.hospital().observed_session_inits().is_empty());
}

#[tokio::test]
async fn messages_from_strangers_are_acknowledged_and_dropped() {
    let bob = bob().await;
    let bytes = initiation(PING, 1).to_bytes().unwrap();

    let delivery = bob.messaging.receive("O=Mallory", bytes, "mallory-1");

    assert_eq!(delivery.acks(), 1);
    assert!(bob.manager.snapshot().is_empty());
    assert!(bob.messaging.sent().is_empty());
}

#[tokio::test]
async fn undecodable_messages_are_acknowledged_and_dropped() {
    let bob = bob().await;

    let delivery = bob.messaging.receive(ALICE, vec![0xff; 3], "garbage-1");

    assert_eq!(delivery.acks(), 1);
    assert!(bob.manager.snapshot().is_empty());
}

#[tokio::test]
async fn messages_for_unknown_sessions_are_acknowledged() {
    let bob = bob().await;
    let alice = Party::new(ALICE);

    let data = bob
        .messaging
        .deliver(&alice, &existing(42, ExistingSessionPayload::Data(vec![1])), "data-1")
        .unwrap();
    let end = bob
        .messaging
        .deliver(&alice, &existing(42, ExistingSessionPayload::End), "end-1")
        .unwrap();

    assert_eq!(data.acks(), 1);
    assert_eq!(end.acks(), 1);
    assert_eq!(bob.messaging.unacknowledged(), 0);
}

// ============================================================================
// Two nodes
// ============================================================================

#[tokio::test]
async fn ping_pong_between_two_nodes() {
    let network = InMemoryNetwork::new();
    let alice = start_node(network.messaging(Party::new(ALICE))).await;
    let bob = start_node(network.messaging(Party::new(BOB))).await;

    let handle = alice
        .manager
        .start_flow(
            &PingFlow::new(Party::new(BOB)),
            InvocationContext::rpc("test"),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(handle.result_as::<String>().await.unwrap(), "pong");

    eventually(|| alice.manager.snapshot().is_empty() && bob.manager.snapshot().is_empty()).await;
    eventually(|| alice.messaging.unacknowledged() == 0 && bob.messaging.unacknowledged() == 0)
        .await;
    assert!(alice.store.is_empty());
    assert!(bob.store.is_empty());
}
