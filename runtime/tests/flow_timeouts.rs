//! Integration tests for flow timeouts
//!
//! Time is paused, so the runtime jumps straight to the next timer whenever
//! every task is idle and hour-long timeouts take no wall-clock time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use flowmachine_core::context::InvocationContext;
use flowmachine_core::error::FlowErrorKind;
use flowmachine_core::id::FlowId;
use flowmachine_core::identity::Party;
use flowmachine_runtime::{
    AdmissionKind, FlowStateMachineManager, FlowTimeoutConfig, StateMachineConfig,
    StateMachineServices, Verdict,
};
use flowmachine_testing::flows::{sample_catalog, TimedWaitFlow};
use flowmachine_testing::{
    test_clock, InMemoryCheckpointStore, InMemoryNetworkMap, RecordingMessaging,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const ALICE: &str = "O=Alice";

/// Five second timeouts, doubling on every retry.
fn config() -> StateMachineConfig {
    StateMachineConfig::default().with_flow_timeout(
        FlowTimeoutConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_backoff_base(2.0)
            .with_max_restart_count(6),
    )
}

async fn started_manager() -> (FlowStateMachineManager, InMemoryCheckpointStore) {
    let store = InMemoryCheckpointStore::new();
    let services = StateMachineServices {
        checkpoint_store: Arc::new(store.clone()),
        messaging: Arc::new(RecordingMessaging::new(Party::new(ALICE))),
        network_map: Arc::new(InMemoryNetworkMap::new()),
        catalog: Arc::new(sample_catalog()),
        clock: Arc::new(test_clock()),
    };
    let manager = FlowStateMachineManager::new(config(), Party::new(ALICE), services);
    manager.start(std::future::ready(())).await.unwrap();
    (manager, store)
}

async fn start_waiting(manager: &FlowStateMachineManager, flow: TimedWaitFlow) -> FlowId {
    manager
        .start_flow(&flow, InvocationContext::rpc("test"), None, None)
        .await
        .unwrap()
        .id
}

fn timeouts(manager: &FlowStateMachineManager, flow_id: FlowId) -> usize {
    manager
        .hospital()
        .records(flow_id)
        .iter()
        .filter(|record| {
            record.kind == AdmissionKind::FlowError
                && record
                    .errors
                    .iter()
                    .any(|error| error.kind() == FlowErrorKind::Timeout)
        })
        .count()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timed_out_flows_are_retried_with_backoff() {
    let (manager, store) = started_manager().await;
    let flow_id = start_waiting(&manager, TimedWaitFlow::new()).await;

    // Jittered delays are in [d/2, d): the third timeout fires by 5 + 10 + 20
    // seconds, the fourth not before 2.5 + 5 + 10 + 20.
    tokio::time::sleep(Duration::from_secs(36)).await;

    let records = manager.hospital().records(flow_id);
    assert_eq!(timeouts(&manager, flow_id), 3);
    assert!(records.iter().all(|record| record.verdict == Verdict::Retry));
    assert!(records.iter().all(|record| record.by == vec!["TimeoutDoctor"]));
    // Retried in place: same id, checkpoint kept.
    let registered = manager.snapshot();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].id, flow_id);
    assert!(store.contains(flow_id));
}

#[tokio::test(start_paused = true)]
async fn flows_can_ask_for_a_longer_timeout() {
    let (manager, _store) = started_manager().await;
    let flow_id = start_waiting(&manager, TimedWaitFlow::new().with_custom_timeout(60)).await;

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(timeouts(&manager, flow_id), 0);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(timeouts(&manager, flow_id), 1);
}

#[tokio::test(start_paused = true)]
async fn custom_timeouts_below_the_configured_one_are_ignored() {
    let (manager, _store) = started_manager().await;
    let flow_id = start_waiting(&manager, TimedWaitFlow::new().with_custom_timeout(1)).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(timeouts(&manager, flow_id), 0);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(timeouts(&manager, flow_id), 1);
}

#[tokio::test(start_paused = true)]
async fn killed_flows_leave_timeout_supervision() {
    let (manager, _store) = started_manager().await;
    let flow_id = start_waiting(&manager, TimedWaitFlow::new()).await;

    assert!(manager.kill_flow(flow_id).await);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(manager.hospital().records(flow_id).is_empty());
    assert!(manager.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stopping_cancels_pending_timeouts() {
    let (manager, store) = started_manager().await;
    let flow_id = start_waiting(&manager, TimedWaitFlow::new()).await;
    tokio::task::yield_now().await;

    manager.stop(0).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(timeouts(&manager, flow_id), 0);
    assert!(store.contains(flow_id));
}
