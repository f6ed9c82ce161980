//! # Flowmachine Testing
//!
//! Testing utilities for the flow state machine.
//!
//! This crate provides:
//! - Mock implementations of the manager's injected services
//! - An in-memory checkpoint store and an in-memory peer network
//! - Sample flows exercising sessions, checkpoints, sleeps and failures
//! - A Given-When-Then harness for the pure transition function
//! - proptest strategies for core types
//!
//! ## Example
//!
//! ```ignore
//! use flowmachine_testing::{InMemoryCheckpointStore, InMemoryNetwork, flows};
//!
//! #[tokio::test]
//! async fn ping_gets_pong() {
//!     let network = InMemoryNetwork::new();
//!     let alice = node("O=Alice", &network).await;
//!     let bob = node("O=Bob", &network).await;
//!
//!     let handle = alice
//!         .start_flow(&flows::PingFlow::new(bob_party), InvocationContext::rpc("test"), None, None)
//!         .await?;
//!     assert_eq!(handle.result_as::<String>().await?, "pong");
//! }
//! ```

use chrono::{DateTime, Utc};
use flowmachine_core::context::Clock;

pub mod flows;
pub mod messaging_mocks;
pub mod store_mocks;

/// Mock implementations of the manager's injected services.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use flowmachine_core::external::DeduplicationHandler;
    use flowmachine_core::id::DeduplicationId;
    use flowmachine_core::identity::{NetworkMapCache, Party};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flowmachine_testing::mocks::FixedClock;
    /// use flowmachine_core::context::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Deduplication handler that counts its acknowledgements.
    ///
    /// The state machine must acknowledge every delivery exactly once, so
    /// most assertions are `assert_eq!(handler.acks(), 1)`.
    #[derive(Debug)]
    pub struct TestDeduplicationHandler {
        id: DeduplicationId,
        acks: AtomicUsize,
        inside: AtomicUsize,
    }

    impl TestDeduplicationHandler {
        /// Create a handler for the delivery `id`
        #[must_use]
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: DeduplicationId::new(id),
                acks: AtomicUsize::new(0),
                inside: AtomicUsize::new(0),
            }
        }

        /// Times the delivery was acknowledged
        #[must_use]
        pub fn acks(&self) -> usize {
            self.acks.load(Ordering::SeqCst)
        }

        /// Times the delivery was recorded inside a transaction
        #[must_use]
        pub fn persisted(&self) -> usize {
            self.inside.load(Ordering::SeqCst)
        }
    }

    impl DeduplicationHandler for TestDeduplicationHandler {
        fn deduplication_id(&self) -> &DeduplicationId {
            &self.id
        }

        fn inside_database_transaction(&self) {
            self.inside.fetch_add(1, Ordering::SeqCst);
        }

        fn after_database_transaction(&self) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Network map over a fixed set of parties.
    #[derive(Debug, Default)]
    pub struct InMemoryNetworkMap {
        parties: RwLock<HashMap<String, Party>>,
    }

    impl InMemoryNetworkMap {
        /// Create an empty network map
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a party
        #[must_use]
        pub fn with_peer(self, party: Party) -> Self {
            self.add_peer(party);
            self
        }

        /// Add a party to a shared map
        pub fn add_peer(&self, party: Party) {
            self.parties
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(party.name().to_string(), party);
        }
    }

    impl NetworkMapCache for InMemoryNetworkMap {
        fn peer_by_legal_name(&self, name: &str) -> Option<Party> {
            self.parties
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a test subscriber that honours `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs anything.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use flowmachine_core::error::{FlowError, FlowErrorKind};
    use flowmachine_core::id::SessionId;
    use flowmachine_core::identity::Party;
    use proptest::prelude::*;

    /// Any error kind.
    pub fn arb_error_kind() -> impl Strategy<Value = FlowErrorKind> {
        prop_oneof![
            Just(FlowErrorKind::Logic),
            Just(FlowErrorKind::Timeout),
            Just(FlowErrorKind::Transient),
            Just(FlowErrorKind::SessionEnded),
            Just(FlowErrorKind::SessionRejected),
            Just(FlowErrorKind::Counterparty),
            Just(FlowErrorKind::Infrastructure),
            Just(FlowErrorKind::Shutdown),
            Just(FlowErrorKind::Killed),
        ]
    }

    /// Any flow error.
    pub fn arb_flow_error() -> impl Strategy<Value = FlowError> {
        (arb_error_kind(), "[a-z ]{0,24}", any::<u64>())
            .prop_map(|(kind, message, id)| FlowError::with_id(kind, message, id))
    }

    /// Any session id.
    pub fn arb_session_id() -> impl Strategy<Value = SessionId> {
        any::<u64>().prop_map(SessionId::new)
    }

    /// A party with an `O=` legal name.
    pub fn arb_party() -> impl Strategy<Value = Party> {
        "[A-Z][a-z]{2,8}".prop_map(|name| Party::new(format!("O={name}")))
    }
}

pub use messaging_mocks::{InMemoryNetwork, RecordingMessaging, SentMessage};
pub use mocks::{FixedClock, InMemoryNetworkMap, TestDeduplicationHandler, test_clock};
pub use store_mocks::InMemoryCheckpointStore;
pub use transition_test::TransitionTest;
