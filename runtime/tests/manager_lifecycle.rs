//! Integration tests for starting, finishing, killing and restoring flows
//!
//! Each test runs a real manager over the in-memory checkpoint store and a
//! recording messaging layer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowmachine_core::catalog::FlowCatalog;
use flowmachine_core::checkpoint::{Checkpoint, CheckpointError, FlowStart, FlowState};
use flowmachine_core::checkpoint_store::CheckpointStore;
use flowmachine_core::context::InvocationContext;
use flowmachine_core::error::{FlowError, FlowErrorKind};
use flowmachine_core::flow::{
    FlowContext, FlowIoRequest, FlowLogic, FlowResume, FlowStep, FrozenFlow,
};
use flowmachine_core::id::FlowId;
use flowmachine_core::identity::Party;
use flowmachine_runtime::{
    Change, FlowStateMachineManager, LifeCycleState, ManagerError, StateMachineConfig,
    StateMachineServices, Verdict,
};
use flowmachine_testing::flows::{
    sample_catalog, CountdownFlow, Failure, FailingFlow, SleepyFlow, TimedWaitFlow, COUNTDOWN,
    TIMED_WAIT,
};
use flowmachine_testing::{
    test_clock, InMemoryCheckpointStore, InMemoryNetworkMap, RecordingMessaging,
    TestDeduplicationHandler,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Fixtures
// ============================================================================

const ALICE: &str = "O=Alice";

struct Node {
    manager: FlowStateMachineManager,
    store: InMemoryCheckpointStore,
    messaging: Arc<RecordingMessaging>,
}

fn new_node(store: InMemoryCheckpointStore) -> Node {
    let messaging = Arc::new(RecordingMessaging::new(Party::new(ALICE)));
    let services = StateMachineServices {
        checkpoint_store: Arc::new(store.clone()),
        messaging: messaging.clone(),
        network_map: Arc::new(InMemoryNetworkMap::new().with_peer(Party::new(ALICE))),
        catalog: Arc::new(sample_catalog()),
        clock: Arc::new(test_clock()),
    };
    let manager =
        FlowStateMachineManager::new(StateMachineConfig::default(), Party::new(ALICE), services);
    Node {
        manager,
        store,
        messaging,
    }
}

async fn started_node() -> Node {
    let node = new_node(InMemoryCheckpointStore::new());
    node.manager.start(std::future::ready(())).await.unwrap();
    node
}

fn rpc() -> InvocationContext {
    InvocationContext::rpc("test")
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

/// Wait for the next removal on the change feed.
async fn next_removal(changes: &mut mpsc::UnboundedReceiver<Change>) -> Change {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match changes.recv().await.unwrap() {
                change @ Change::Removed(..) => return change,
                Change::Add(_) => {}
            }
        }
    })
    .await
    .expect("no flow was removed within five seconds")
}

/// A never-run flow's checkpoint, as a previous run of the node left it.
fn stored_unstarted(store: &InMemoryCheckpointStore, logic: &dyn FlowLogic) -> FlowId {
    let checkpoint = Checkpoint::create(
        rpc(),
        FlowStart::Explicit,
        logic.freeze().unwrap(),
        Party::new(ALICE),
        logic.is_timed(),
    );
    let flow_id = FlowId::random();
    store.insert_raw(flow_id, checkpoint.serialize().unwrap().into_inner());
    flow_id
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn lifecycle_moves_forward_only() {
    let node = new_node(InMemoryCheckpointStore::new());
    assert_eq!(node.manager.lifecycle_state(), LifeCycleState::Unstarted);

    assert_ok!(node.manager.start(std::future::ready(())).await);
    assert_eq!(node.manager.lifecycle_state(), LifeCycleState::Started);

    let again = node.manager.start(std::future::ready(())).await;
    assert!(matches!(
        again,
        Err(ManagerError::WrongLifeCycle {
            expected: LifeCycleState::Unstarted,
            actual: LifeCycleState::Started,
        })
    ));

    assert_ok!(node.manager.stop(0).await);
    assert_eq!(node.manager.lifecycle_state(), LifeCycleState::Stopped);
    assert_err!(node.manager.stop(0).await);
}

#[tokio::test]
async fn flows_cannot_start_before_the_manager() {
    let node = new_node(InMemoryCheckpointStore::new());

    let result = node
        .manager
        .start_flow(&CountdownFlow::new(1), rpc(), None, None)
        .await;

    assert!(matches!(
        result,
        Err(ManagerError::WrongLifeCycle {
            expected: LifeCycleState::Started,
            actual: LifeCycleState::Unstarted,
        })
    ));
}

#[tokio::test]
async fn stopping_leaves_suspended_flows_for_the_next_start() {
    let node = started_node().await;
    let handle = node
        .manager
        .start_flow(&TimedWaitFlow::new(), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;
    eventually(|| node.store.contains(flow_id)).await;

    node.manager.stop(0).await.unwrap();

    let error = handle.result().await.unwrap_err();
    assert_eq!(error.kind(), FlowErrorKind::Shutdown);
    assert!(node.store.contains(flow_id));
    assert!(node.manager.snapshot().is_empty());
    assert!(matches!(
        node.manager
            .start_flow(&CountdownFlow::new(1), rpc(), None, None)
            .await,
        Err(ManagerError::WrongLifeCycle { .. })
    ));

    // The next run of the node picks the flow up again.
    let restarted = new_node(node.store.clone());
    restarted.manager.start(std::future::ready(())).await.unwrap();
    let restored = restarted.manager.snapshot();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id, flow_id);
    assert_eq!(restored[0].flow_name, TIMED_WAIT);
}

// ============================================================================
// Running flows
// ============================================================================

#[tokio::test]
async fn finished_flows_return_their_value_and_leave_no_checkpoint() {
    let node = started_node().await;

    let handle = node
        .manager
        .start_flow(&CountdownFlow::new(3), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;

    assert_eq!(handle.result_as::<u32>().await.unwrap(), 3);
    assert!(!node.store.contains(flow_id));
    eventually(|| node.manager.snapshot().is_empty()).await;
}

#[tokio::test]
async fn sleeping_flows_wake_up() {
    let node = started_node().await;

    let handle = node
        .manager
        .start_flow(&SleepyFlow::new(Duration::from_millis(20)), rpc(), None, None)
        .await
        .unwrap();

    assert_eq!(handle.result_as::<String>().await.unwrap(), "rested");
}

#[tokio::test]
async fn logic_errors_fail_the_flow() {
    let node = started_node().await;

    let handle = node
        .manager
        .start_flow(&FailingFlow::new(Failure::Logic), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;

    let error = handle.result().await.unwrap_err();
    assert_eq!(error.kind(), FlowErrorKind::Logic);
    assert_eq!(error.message(), "failing flow failed");
    assert!(!node.store.contains(flow_id));
    // Removal discharges the flow from the hospital.
    assert!(node.manager.hospital().records(flow_id).is_empty());
}

#[tokio::test]
async fn transient_errors_are_retried_then_kept_for_observation() {
    let node = started_node().await;

    let handle = node
        .manager
        .start_flow(&FailingFlow::new(Failure::Transient), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;
    let hospital = Arc::clone(node.manager.hospital());

    eventually(|| hospital.under_observation().contains(&flow_id)).await;

    let records = hospital.records(flow_id);
    assert_eq!(records.len(), 4);
    assert!(records[..3]
        .iter()
        .all(|record| record.verdict == Verdict::Retry));
    assert_eq!(records[3].verdict, Verdict::Observe);
    // Still registered, still checkpointed, waiting for an operator.
    assert!(node.store.contains(flow_id));
    assert_eq!(node.manager.snapshot().len(), 1);
}

#[tokio::test]
async fn flows_outside_the_catalog_are_not_started() {
    #[derive(Debug)]
    struct Unregistered;

    impl FlowLogic for Unregistered {
        fn flow_name(&self) -> &'static str {
            "unregistered"
        }

        fn resume(&mut self, _ctx: &mut FlowContext, _input: FlowResume) -> Result<FlowStep, FlowError> {
            unreachable!("never thawed")
        }

        fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
            Ok(FrozenFlow::new("unregistered", Vec::new()))
        }
    }

    let node = started_node().await;

    let result = node.manager.start_flow(&Unregistered, rpc(), None, None).await;

    assert!(matches!(result, Err(ManagerError::FlowNotStarted(name)) if name == "unregistered"));
    assert!(node.manager.snapshot().is_empty());
}

// ============================================================================
// Killing
// ============================================================================

#[tokio::test]
async fn killing_removes_the_flow_and_its_checkpoint() {
    let node = started_node().await;
    let handle = node
        .manager
        .start_flow(&TimedWaitFlow::new(), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;
    eventually(|| node.store.contains(flow_id)).await;

    assert!(node.manager.kill_flow(flow_id).await);

    let error = handle.result().await.unwrap_err();
    assert_eq!(error.kind(), FlowErrorKind::Killed);
    assert!(!node.store.contains(flow_id));
    assert!(node.manager.snapshot().is_empty());
    assert!(!node.manager.kill_flow(flow_id).await);
}

#[tokio::test]
async fn killing_an_unknown_flow_is_not_an_error() {
    let node = started_node().await;

    assert!(!node.manager.kill_flow(FlowId::random()).await);
    assert!(!node.manager.retry_flow(FlowId::random()));
}

// ============================================================================
// Change feed
// ============================================================================

#[tokio::test]
async fn track_reports_additions_and_removals() {
    let node = started_node().await;
    let (existing, mut changes) = node.manager.track();
    assert!(existing.is_empty());

    let handle = node
        .manager
        .start_flow(&CountdownFlow::new(1), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;

    let Change::Add(added) = changes.recv().await.unwrap() else {
        panic!("expected the addition first");
    };
    assert_eq!(added.id, flow_id);
    assert_eq!(added.flow_name, COUNTDOWN);

    let Change::Removed(removed, result) = next_removal(&mut changes).await else {
        unreachable!()
    };
    assert_eq!(removed.id, flow_id);
    assert!(result.is_ok());
    assert_eq!(handle.result_as::<u32>().await.unwrap(), 1);
}

#[tokio::test]
async fn readers_that_fall_behind_still_see_every_addition() {
    let node = started_node().await;
    let (_, mut changes) = node.manager.track();

    let mut started = Vec::new();
    for _ in 0..300 {
        let handle = node
            .manager
            .start_flow(&TimedWaitFlow::new(), rpc(), None, None)
            .await
            .unwrap();
        started.push(handle.id);
    }

    let mut added = Vec::new();
    while let Ok(change) = changes.try_recv() {
        if let Change::Add(info) = change {
            added.push(info.id);
        }
    }
    assert_eq!(added, started);
    assert_eq!(node.manager.snapshot().len(), 300);
}

#[tokio::test]
async fn killed_flows_appear_as_removed_with_the_kill_error() {
    let node = started_node().await;
    let handle = node
        .manager
        .start_flow(&TimedWaitFlow::new(), rpc(), None, None)
        .await
        .unwrap();
    let (existing, mut changes) = node.manager.track();
    assert_eq!(existing.len(), 1);

    node.manager.kill_flow(handle.id).await;

    let Change::Removed(removed, result) = next_removal(&mut changes).await else {
        unreachable!()
    };
    assert_eq!(removed.id, handle.id);
    assert_eq!(result.unwrap_err().kind(), FlowErrorKind::Killed);
}

// ============================================================================
// Restoring
// ============================================================================

#[tokio::test]
async fn restored_flows_wait_for_the_node_to_be_ready() {
    let store = InMemoryCheckpointStore::new();
    let flow_id = stored_unstarted(&store, &CountdownFlow::new(2));
    let original = store.peek(flow_id);
    let node = new_node(store);
    let (ready, node_ready) = tokio::sync::oneshot::channel::<()>();

    node.manager
        .start(async move {
            let _ = node_ready.await;
        })
        .await
        .unwrap();
    let (restored, mut changes) = node.manager.track();

    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id, flow_id);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(node.store.peek(flow_id), original);
    assert!(!node.messaging.is_started());

    ready.send(()).unwrap();

    let Change::Removed(removed, result) = next_removal(&mut changes).await else {
        unreachable!()
    };
    assert_eq!(removed.id, flow_id);
    assert!(result.is_ok());
    assert!(node.messaging.is_started());
    eventually(|| !node.store.contains(flow_id)).await;
}

#[tokio::test]
async fn unstarted_and_suspended_checkpoints_are_each_restored_once() {
    let store = InMemoryCheckpointStore::new();
    let unstarted = stored_unstarted(&store, &TimedWaitFlow::new());

    let logic = TimedWaitFlow::new();
    let mut checkpoint = Checkpoint::create(
        rpc(),
        FlowStart::Explicit,
        logic.freeze().unwrap(),
        Party::new(ALICE),
        true,
    );
    checkpoint.flow_state = FlowState::Started {
        frozen_flow: logic.freeze().unwrap(),
        pending_io: FlowIoRequest::sleep(Duration::from_secs(3600)),
    };
    checkpoint.number_of_suspends = 1;
    let suspended = FlowId::random();
    store.insert_raw(suspended, checkpoint.serialize().unwrap().into_inner());

    let node = new_node(store);
    node.manager.start(std::future::ready(())).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let mut ids: Vec<FlowId> = node.manager.snapshot().iter().map(|info| info.id).collect();
    ids.sort();
    let mut expected = vec![unstarted, suspended];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(node
        .manager
        .snapshot()
        .iter()
        .all(|info| info.flow_name == TIMED_WAIT));
}

#[tokio::test]
async fn unreadable_checkpoints_are_skipped() {
    let store = InMemoryCheckpointStore::new();
    let corrupt = FlowId::random();
    store.insert_raw(corrupt, vec![0xde, 0xad, 0xbe, 0xef]);
    let good = stored_unstarted(&store, &CountdownFlow::new(1));
    let node = new_node(store);

    node.manager.start(std::future::ready(())).await.unwrap();

    let ids: Vec<FlowId> = node.manager.snapshot().iter().map(|info| info.id).collect();
    assert!(!ids.contains(&corrupt));
    // The corrupt checkpoint is left alone for an operator.
    assert!(node.store.contains(corrupt));
    eventually(|| !node.store.contains(good)).await;
}

#[tokio::test]
async fn checkpoints_written_by_a_flow_restore_it() {
    let store = InMemoryCheckpointStore::new();
    let first = new_node(store.clone());
    first.manager.start(std::future::ready(())).await.unwrap();
    let handle = first
        .manager
        .start_flow(&TimedWaitFlow::new(), rpc(), None, None)
        .await
        .unwrap();
    let flow_id = handle.id;
    let suspended = |store: &InMemoryCheckpointStore| {
        store
            .peek(flow_id)
            .and_then(|stored| stored.deserialize().ok())
            .is_some_and(|checkpoint| checkpoint.number_of_suspends == 1)
    };
    eventually(|| suspended(&store)).await;

    let stored = store.get(flow_id).await.unwrap().unwrap();
    let checkpoint = stored.deserialize().unwrap();
    assert_eq!(checkpoint.flow_name(), TIMED_WAIT);
    assert!(checkpoint.is_timed());
}

// ============================================================================
// Retrying
// ============================================================================

static FLAKED: AtomicBool = AtomicBool::new(false);

/// Idempotent, so never checkpointed before it finishes. Fails transiently
/// the first time it runs in this process.
#[derive(Debug, Serialize, Deserialize)]
struct FlakyStart;

impl FlowLogic for FlakyStart {
    fn flow_name(&self) -> &'static str {
        "flaky_start"
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn resume(&mut self, _ctx: &mut FlowContext, input: FlowResume) -> Result<FlowStep, FlowError> {
        match input {
            FlowResume::Failed(error) => Err(error),
            _ if !FLAKED.swap(true, Ordering::SeqCst) => Err(FlowError::transient("flaked")),
            _ => FlowStep::finish(&"steady".to_string()),
        }
    }

    fn freeze(&self) -> Result<FrozenFlow, CheckpointError> {
        FrozenFlow::freeze("flaky_start", self)
    }
}

#[tokio::test]
async fn flows_retried_before_their_first_checkpoint_start_over() {
    let store = InMemoryCheckpointStore::new();
    let services = StateMachineServices {
        checkpoint_store: Arc::new(store.clone()),
        messaging: Arc::new(RecordingMessaging::new(Party::new(ALICE))),
        network_map: Arc::new(InMemoryNetworkMap::new()),
        catalog: Arc::new(FlowCatalog::new().with_flow::<FlakyStart>("flaky_start")),
        clock: Arc::new(test_clock()),
    };
    let manager =
        FlowStateMachineManager::new(StateMachineConfig::default(), Party::new(ALICE), services);
    manager.start(std::future::ready(())).await.unwrap();
    let (_, mut changes) = manager.track();
    let start_request = Arc::new(TestDeduplicationHandler::new("start-1"));

    let handle = manager
        .start_flow(&FlakyStart, rpc(), None, Some(start_request.clone()))
        .await
        .unwrap();
    let first = handle.id;

    let Change::Removed(removed, result) = next_removal(&mut changes).await else {
        unreachable!()
    };
    assert_eq!(removed.id, first);
    assert_eq!(result.unwrap_err().kind(), FlowErrorKind::Shutdown);

    // The start request is delivered again and runs as a new flow.
    let Change::Removed(rerun, result) = next_removal(&mut changes).await else {
        unreachable!()
    };
    assert_ne!(rerun.id, first);
    assert!(result.is_ok());
    eventually(|| start_request.acks() == 1).await;
    assert_eq!(store.get_calls(), 0);
    assert!(store.is_empty());
    assert_eq!(handle.result().await.unwrap_err().kind(), FlowErrorKind::Shutdown);
}
