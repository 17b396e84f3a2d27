//! Process-local registry of suspended dequeue calls.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::warn;

/// Which queues a consumer is able to drain.
pub(crate) type Predicate<Q> = Arc<dyn Fn(&Q) -> bool + Send + Sync>;

/// Evaluate `predicate`, treating a panic as "no match".
pub(crate) fn accepts<Q: Debug>(predicate: &(dyn Fn(&Q) -> bool + Send + Sync), queue: &Q) -> bool {
    match catch_unwind(AssertUnwindSafe(|| predicate(queue))) {
        Ok(matched) => matched,
        Err(_) => {
            warn!(?queue, "queue predicate panicked, treating as no match");
            false
        }
    }
}

/// A waiting dequeue call: its predicate and a single-assignment slot.
pub(crate) struct Listener<Q, T> {
    id: u64,
    predicate: Predicate<Q>,
    slot: Mutex<Option<oneshot::Sender<(Q, T)>>>,
}

impl<Q: Debug, T> Listener<Q, T> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn accepts(&self, queue: &Q) -> bool {
        accepts(&*self.predicate, queue)
    }

    /// True once the slot was filled or closed, or the waiter went away.
    pub(crate) fn is_resolved(&self) -> bool {
        self.slot().as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Fill the slot. The pair comes back if the slot was already resolved
    /// or nobody is waiting on it anymore.
    pub(crate) fn deliver(&self, queue: Q, task: T) -> Result<(), (Q, T)> {
        let sender = self.slot().take();
        match sender {
            Some(tx) => tx.send((queue, task)),
            None => Err((queue, task)),
        }
    }

    /// Resolve the slot with no value. Returns false if something was
    /// delivered first.
    pub(crate) fn close(&self) -> bool {
        self.slot().take().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<(Q, T)>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct ListenerRegistry<Q, T> {
    next_id: AtomicU64,
    // Ordered by id so dispatch favours the longest waiter.
    listeners: Mutex<BTreeMap<u64, Arc<Listener<Q, T>>>>,
}

impl<Q: Debug, T> ListenerRegistry<Q, T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        predicate: Predicate<Q>,
    ) -> (Arc<Listener<Q, T>>, oneshot::Receiver<(Q, T)>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Listener {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            predicate,
            slot: Mutex::new(Some(tx)),
        });
        self.lock().insert(listener.id, listener.clone());
        (listener, rx)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Up to `limit` unresolved listeners whose ids are not in `checked`.
    pub(crate) fn sample(&self, checked: &HashSet<u64>, limit: usize) -> Vec<Arc<Listener<Q, T>>> {
        self.lock()
            .values()
            .filter(|l| !checked.contains(&l.id) && !l.is_resolved())
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Listener<Q, T>>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
