//! In-memory checkpoint store for fast, deterministic tests.

use flowmachine_core::checkpoint::SerializedCheckpoint;
use flowmachine_core::checkpoint_store::{
    CheckpointStore, CheckpointStoreError, CheckpointStream, StoreFuture,
};
use flowmachine_core::id::FlowId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// HashMap-backed [`CheckpointStore`].
///
/// Clones share the same map, so a test can keep one clone for assertions and
/// hand another to the manager. A second manager built over the same store
/// sees the first one's checkpoints, which is how restarts are tested.
///
/// # Example
///
/// ```
/// use flowmachine_testing::InMemoryCheckpointStore;
/// use flowmachine_core::checkpoint::SerializedCheckpoint;
/// use flowmachine_core::checkpoint_store::CheckpointStore;
/// use flowmachine_core::id::FlowId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
/// let id = FlowId::random();
/// store.put(id, SerializedCheckpoint::from_bytes(vec![1, 2, 3])).await?;
/// assert!(store.get(id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<FlowId, SerializedCheckpoint>>>,
    get_calls: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.read(HashMap::len)
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read(HashMap::is_empty)
    }

    /// Whether a checkpoint of `id` is stored
    #[must_use]
    pub fn contains(&self, id: FlowId) -> bool {
        self.read(|checkpoints| checkpoints.contains_key(&id))
    }

    /// The stored checkpoint of `id`, without counting a read
    #[must_use]
    pub fn peek(&self, id: FlowId) -> Option<SerializedCheckpoint> {
        self.read(|checkpoints| checkpoints.get(&id).cloned())
    }

    /// Store bytes directly, bypassing serialization
    ///
    /// Used to plant corrupt or foreign checkpoints.
    pub fn insert_raw(&self, id: FlowId, bytes: Vec<u8>) {
        self.checkpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, SerializedCheckpoint::from_bytes(bytes));
    }

    /// Times [`CheckpointStore::get`] was called
    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Make every following `put` and `remove` fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<FlowId, SerializedCheckpoint>) -> T) -> T {
        f(&self.checkpoints.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn check_writable(&self) -> Result<(), CheckpointStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(CheckpointStoreError::Unavailable(
                "writes disabled by test".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn put(&self, id: FlowId, checkpoint: SerializedCheckpoint) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.checkpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, checkpoint);
            Ok(())
        })
    }

    fn get(&self, id: FlowId) -> StoreFuture<'_, Option<SerializedCheckpoint>> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.peek(id))
        })
    }

    fn remove(&self, id: FlowId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_writable()?;
            Ok(self
                .checkpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some())
        })
    }

    fn get_all(&self) -> CheckpointStream<'_> {
        // Snapshot first so the stream never holds the lock across a yield.
        let snapshot: Vec<(FlowId, SerializedCheckpoint)> = self.read(|checkpoints| {
            checkpoints
                .iter()
                .map(|(id, checkpoint)| (*id, checkpoint.clone()))
                .collect()
        });
        Box::pin(async_stream::stream! {
            for entry in snapshot {
                yield Ok(entry);
            }
        })
    }
}
