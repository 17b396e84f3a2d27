//! In-process store, for tests and single-process deployments.
//!
//! Every operation runs under one mutex, so the transactional operations are
//! trivially atomic. New-queue announcements go through a broadcast channel
//! shared by all clones of the store.

use crate::ports::{Popped, QueueStore, StoreError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Default)]
struct State {
    index: BTreeSet<String>,
    // A queue key exists only while its list is non-empty.
    queues: HashMap<String, VecDeque<String>>,
    heartbeats: HashMap<String, i64>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    announcements: broadcast::Sender<String>,
    available: AtomicBool,
}

/// In-memory `QueueStore`. Clones share the same data.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (announcements, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                announcements,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite a heartbeat, bypassing the scheduler.
    pub fn set_heartbeat(&self, queue: &str, at_millis: i64) {
        self.state().heartbeats.insert(queue.to_string(), at_millis);
    }

    /// Whether `queue` is currently in the index.
    pub fn is_indexed(&self, queue: &str) -> bool {
        self.state().index.contains(queue)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }
}

fn push(list: &mut VecDeque<String>, item: &str, front: bool) {
    if front {
        list.push_front(item.to_string());
    } else {
        list.push_back(item.to_string());
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_existing(
        &self,
        queue: &str,
        item: &str,
        front: bool,
    ) -> Result<bool, StoreError> {
        self.check()?;
        match self.state().queues.get_mut(queue) {
            Some(list) => {
                push(list, item, front);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_and_push(
        &self,
        queue: &str,
        item: &str,
        front: bool,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state();
        if state.queues.contains_key(queue) {
            return Ok(false);
        }
        state.index.insert(queue.to_string());
        push(state.queues.entry(queue.to_string()).or_default(), item, front);
        Ok(true)
    }

    async fn pop(&self, queue: &str) -> Result<Popped, StoreError> {
        self.check()?;
        let mut state = self.state();
        let Some(list) = state.queues.get_mut(queue) else {
            return Ok(Popped::default());
        };
        let item = list.pop_front();
        let remaining = list.len() as u64;
        if remaining == 0 {
            state.queues.remove(queue);
        }
        Ok(Popped { item, remaining })
    }

    async fn remove_if_empty(&self, queue: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state();
        if state.queues.contains_key(queue) {
            return Ok(false);
        }
        state.index.remove(queue);
        Ok(true)
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self.state().index.iter().cloned().collect())
    }

    async fn len(&self, queue: &str) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self
            .state()
            .queues
            .get(queue)
            .map_or(0, |list| list.len() as u64))
    }

    async fn touch(&self, queue: &str, at_millis: i64) -> Result<(), StoreError> {
        self.check()?;
        self.state()
            .heartbeats
            .insert(queue.to_string(), at_millis);
        Ok(())
    }

    async fn heartbeats(&self) -> Result<HashMap<String, i64>, StoreError> {
        self.check()?;
        Ok(self.state().heartbeats.clone())
    }

    async fn forget(&self, queues: &[String]) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state();
        for queue in queues {
            state.heartbeats.remove(queue);
        }
        Ok(())
    }

    async fn publish_new_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.check()?;
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self.shared.announcements.send(queue.to_string());
        Ok(())
    }

    async fn subscribe_new_queues(
        &self,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError> {
        self.check()?;
        let rx = self.shared.announcements.subscribe();
        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(queue) => return Some((Ok(queue), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "new-queue subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}
