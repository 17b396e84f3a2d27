//! Active-queue tracking.
//!
//! Every pop records its queue in a local snapshot. Only the first record of
//! a queue within the refresh window is written through to the shared
//! heartbeat map. The snapshot is copied on write and swapped with a CAS, so
//! concurrent pops never wait on each other here. When the window elapses
//! the whole snapshot starts over.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Snapshot {
    since: Instant,
    queues: HashSet<String>,
}

impl Snapshot {
    fn fresh() -> Self {
        Self {
            since: Instant::now(),
            queues: HashSet::new(),
        }
    }
}

pub(crate) struct ActiveQueueTracker {
    window: Duration,
    snapshot: ArcSwap<Snapshot>,
}

impl ActiveQueueTracker {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            snapshot: ArcSwap::from_pointee(Snapshot::fresh()),
        }
    }

    /// Record that `queue` is being drained. Returns true when the caller
    /// should write the heartbeat through to the store.
    pub(crate) fn record(&self, queue: &str) -> bool {
        loop {
            let current = self.snapshot.load_full();
            let expired = current.since.elapsed() >= self.window;
            if !expired && current.queues.contains(queue) {
                return false;
            }

            let mut next = if expired {
                Snapshot::fresh()
            } else {
                Snapshot {
                    since: current.since,
                    queues: current.queues.clone(),
                }
            };
            next.queues.insert(queue.to_string());

            let previous = self.snapshot.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
        }
    }
}

/// Queues considered abandoned, and heartbeats due for eviction.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Staleness {
    pub(crate) inactive: Vec<String>,
    pub(crate) evict: Vec<String>,
}

/// Split `indexed` queues by heartbeat age. Indexed queues without a fresh
/// heartbeat are inactive; every stale heartbeat is evicted, indexed or not.
pub(crate) fn staleness(
    indexed: &[String],
    heartbeats: &HashMap<String, i64>,
    now_millis: i64,
    stale_after: Duration,
) -> Staleness {
    let stale_after = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now_millis.saturating_sub(stale_after);
    let mut evict: Vec<String> = heartbeats
        .iter()
        .filter(|(_, &at)| at < cutoff)
        .map(|(queue, _)| queue.clone())
        .collect();
    evict.sort();

    let inactive = indexed
        .iter()
        .filter(|queue| heartbeats.get(*queue).map_or(true, |&at| at < cutoff))
        .cloned()
        .collect();

    Staleness { inactive, evict }
}
