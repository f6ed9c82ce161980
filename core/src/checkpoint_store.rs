//! Durable storage of checkpoints.
//!
//! The store is a key-value map `FlowId -> SerializedCheckpoint`. It knows
//! nothing about what is inside a checkpoint.
//!
//! # Implementations
//!
//! - `InMemoryCheckpointStore` (in `flowmachine-testing`): fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
//! so it can be shared as `Arc<dyn CheckpointStore>` between the manager, the
//! action executor and every flow.

use crate::checkpoint::SerializedCheckpoint;
use crate::id::FlowId;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from a checkpoint store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStoreError {
    /// Backend failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The store is not reachable right now; retrying may succeed.
    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Single-pass stream over every stored checkpoint. Dropping it closes it.
pub type CheckpointStream<'a> = Pin<
    Box<dyn Stream<Item = Result<(FlowId, SerializedCheckpoint), CheckpointStoreError>> + Send + 'a>,
>;

/// Result future of a checkpoint store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CheckpointStoreError>> + Send + 'a>>;

/// Durable `FlowId -> SerializedCheckpoint` map.
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint of a flow.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] if the write fails.
    fn put(&self, id: FlowId, checkpoint: SerializedCheckpoint) -> StoreFuture<'_, ()>;

    /// Read the checkpoint of a flow.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] if the read fails.
    fn get(&self, id: FlowId) -> StoreFuture<'_, Option<SerializedCheckpoint>>;

    /// Delete the checkpoint of a flow. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointStoreError`] if the delete fails.
    fn remove(&self, id: FlowId) -> StoreFuture<'_, bool>;

    /// Stream every stored checkpoint.
    fn get_all(&self) -> CheckpointStream<'_>;
}
