use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

/// Failures reported by a backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection loss, pool exhaustion, timeouts.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something we did not expect.
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Result of popping the head of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Popped {
    pub item: Option<String>,
    /// Items left in the queue after the pop.
    pub remaining: u64,
}

/// Shared key-value store holding queues, the queue index, the active-queue
/// heartbeats and the new-queue broadcast channel.
///
/// Queue members and items are already encoded; the adapter owns the key
/// layout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Push onto `queue` only if it already exists.
    /// Returns false when the queue key was absent and nothing was pushed.
    async fn push_existing(&self, queue: &str, item: &str, front: bool)
        -> Result<bool, StoreError>;

    /// In one transaction guarded by "queue key absent": add `queue` to the
    /// index and push `item`.
    /// Returns false when the guard failed or the transaction was rejected.
    async fn create_and_push(
        &self,
        queue: &str,
        item: &str,
        front: bool,
    ) -> Result<bool, StoreError>;

    /// Pop the head of `queue`.
    async fn pop(&self, queue: &str) -> Result<Popped, StoreError>;

    /// Remove `queue` from the index, guarded by "queue key absent".
    /// Returns false when the queue was refilled in the meantime.
    async fn remove_if_empty(&self, queue: &str) -> Result<bool, StoreError>;

    /// Enumerate the queue index.
    async fn queues(&self) -> Result<Vec<String>, StoreError>;

    /// Number of items in `queue`.
    async fn len(&self, queue: &str) -> Result<u64, StoreError>;

    /// Record a heartbeat for `queue`.
    async fn touch(&self, queue: &str, at_millis: i64) -> Result<(), StoreError>;

    /// All heartbeats, keyed by queue member.
    async fn heartbeats(&self) -> Result<HashMap<String, i64>, StoreError>;

    /// Delete heartbeats.
    async fn forget(&self, queues: &[String]) -> Result<(), StoreError>;

    /// Announce a newly created queue to every subscribed instance.
    async fn publish_new_queue(&self, queue: &str) -> Result<(), StoreError>;

    /// Subscribe to new-queue announcements. The stream ends when the
    /// subscription is lost.
    async fn subscribe_new_queues(
        &self,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError>;
}
