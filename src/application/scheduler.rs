//! Multi-queue scheduler: enqueue under a queue id, dequeue by predicate.

use super::dispatcher;
use super::listeners::{accepts, Listener, ListenerRegistry, Predicate};
use super::tracker::{self, ActiveQueueTracker};
use crate::config::SchedulerConfig;
use crate::domain::queue::{decode, encode};
use crate::domain::{Payload, QueueKey};
use crate::error::SchedulerError;
use crate::ports::{QueueStore, StoreError};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by the public handle, its waiters and the dispatcher.
pub(crate) struct Core<S, Q, T> {
    pub(crate) store: S,
    pub(crate) listeners: ListenerRegistry<Q, T>,
    pub(crate) config: SchedulerConfig,
    tracker: ActiveQueueTracker,
}

impl<S, Q, T> Core<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    pub(crate) fn new(store: S, config: SchedulerConfig) -> Self {
        Self {
            store,
            listeners: ListenerRegistry::new(),
            tracker: ActiveQueueTracker::new(config.refresh_window),
            config,
        }
    }

    pub(crate) async fn push(
        &self,
        queue: &Q,
        task: &T,
        front: bool,
    ) -> Result<(), SchedulerError> {
        let member = encode(queue).map_err(SchedulerError::Encode)?;
        let item = encode(task).map_err(SchedulerError::Encode)?;

        loop {
            if self.store.push_existing(&member, &item, front).await? {
                return Ok(());
            }
            if self.store.create_and_push(&member, &item, front).await? {
                break;
            }
            debug!(queue = %member, "queue created concurrently, retrying push");
        }

        // The task is stored; a failed announcement only delays listeners
        // until their next rescan.
        if let Err(e) = self.store.publish_new_queue(&member).await {
            warn!(queue = %member, error = %e, "failed to announce new queue");
        }
        Ok(())
    }

    /// Put a task that was already taken off its queue back at the front.
    pub(crate) async fn restore(&self, queue: &Q, task: T) {
        if let Err(e) = self.push(queue, &task, true).await {
            error!(?queue, error = %e, "failed to push task back onto its queue, task lost");
        }
    }

    pub(crate) async fn pop(&self, queue: &Q) -> Result<Option<T>, SchedulerError> {
        let member = encode(queue).map_err(SchedulerError::Encode)?;
        self.pop_member(&member).await
    }

    /// Pop by the member exactly as it is stored in the index.
    pub(crate) async fn pop_member(&self, member: &str) -> Result<Option<T>, SchedulerError> {
        let Some(raw) = self.pop_raw(member).await? else {
            return Ok(None);
        };
        decode(&raw)
            .map(Some)
            .map_err(|source| SchedulerError::Decode {
                queue: member.to_string(),
                source,
            })
    }

    async fn pop_raw(&self, member: &str) -> Result<Option<String>, StoreError> {
        let popped = self.store.pop(member).await?;
        self.heartbeat(member).await;

        if popped.remaining == 0 {
            match self.store.remove_if_empty(member).await {
                Ok(true) => debug!(queue = %member, "queue drained, removed from index"),
                Ok(false) => debug!(queue = %member, "queue refilled before index removal"),
                Err(e) => warn!(queue = %member, error = %e, "failed to de-index drained queue"),
            }
        }
        Ok(popped.item)
    }

    async fn heartbeat(&self, member: &str) {
        if !self.tracker.record(member) {
            return;
        }
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.touch(member, now).await {
            warn!(queue = %member, error = %e, "failed to refresh queue heartbeat");
        }
    }

    /// Indexed queues that decode to a `Q`, in index order.
    async fn indexed(&self) -> Result<Vec<(String, Q)>, SchedulerError> {
        let members = self.store.queues().await?;
        Ok(members
            .into_iter()
            .filter_map(|member| match decode::<Q>(&member) {
                Ok(queue) => Some((member, queue)),
                Err(e) => {
                    warn!(queue = %member, error = %e, "skipping undecodable queue id");
                    None
                }
            })
            .collect())
    }

    /// Pop from the first indexed queue accepted by `predicate` that still
    /// has a task.
    async fn scan(
        &self,
        predicate: &(dyn Fn(&Q) -> bool + Send + Sync),
    ) -> Result<Option<(Q, T)>, SchedulerError> {
        for (member, queue) in self.indexed().await? {
            if !accepts(predicate, &queue) {
                continue;
            }
            if let Some(task) = self.pop_member(&member).await? {
                return Ok(Some((queue, task)));
            }
        }
        Ok(None)
    }
}

/// A suspended dequeue call. Dropping it unregisters the listener and
/// returns any task handed to it after the caller stopped waiting.
struct Waiter<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    core: Arc<Core<S, Q, T>>,
    listener: Arc<Listener<Q, T>>,
    delivery: oneshot::Receiver<(Q, T)>,
}

impl<S, Q, T> Waiter<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    /// Keep a task this call popped itself, unless a dispatcher already
    /// handed it one; then ours goes back to the front of its queue.
    async fn claim(&mut self, hit: (Q, T)) -> Option<(Q, T)> {
        if self.listener.close() {
            return Some(hit);
        }
        match (&mut self.delivery).await {
            Ok(delivered) => {
                debug!(queue = ?hit.0, "lost hand-off race, pushing popped task back");
                let (queue, task) = hit;
                self.core.restore(&queue, task).await;
                Some(delivered)
            }
            Err(_) => Some(hit),
        }
    }

    /// Resolve the slot with nothing, or collect what was delivered first.
    async fn settle(&mut self) -> Option<(Q, T)> {
        if self.listener.close() {
            return None;
        }
        (&mut self.delivery).await.ok()
    }
}

impl<S, Q, T> Drop for Waiter<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    fn drop(&mut self) {
        self.core.listeners.remove(self.listener.id());
        self.listener.close();
        self.delivery.close();
        let Ok((queue, task)) = self.delivery.try_recv() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let core = self.core.clone();
                handle.spawn(async move { core.restore(&queue, task).await });
            }
            Err(_) => error!(?queue, "waiter dropped outside a runtime, task lost"),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle to one scheduler instance.
///
/// Starting a scheduler subscribes to new-queue announcements and spawns the
/// dispatcher that hands tasks of freshly created queues to local waiters.
/// Dropping the handle stops the dispatcher.
pub struct Scheduler<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    core: Arc<Core<S, Q, T>>,
    shutdown: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl<S, Q, T> Scheduler<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    pub async fn start(store: S, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let subscription = store.subscribe_new_queues().await?;
        let core = Arc::new(Core::new(store, config.normalized()));
        let shutdown = CancellationToken::new();
        let dispatcher = dispatcher::spawn(core.clone(), subscription, shutdown.clone());
        info!("scheduler started");

        Ok(Self {
            core,
            shutdown,
            dispatcher: Some(dispatcher),
        })
    }

    /// Append `task` to `queue` (or prepend it with `at_front`), creating the
    /// queue if needed.
    pub async fn enqueue(&self, queue: &Q, task: &T, at_front: bool) -> Result<(), SchedulerError> {
        self.core.push(queue, task, at_front).await
    }

    /// Pop the head of one named queue, without waiting.
    pub async fn dequeue(&self, queue: &Q) -> Result<Option<T>, SchedulerError> {
        self.core.pop(queue).await
    }

    /// Take a task from any queue accepted by `predicate`, waiting until one
    /// shows up or `cancel` fires. A cancelled call returns `None`.
    pub async fn dequeue_matching<P>(
        &self,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<Option<(Q, T)>, SchedulerError>
    where
        P: Fn(&Q) -> bool + Send + Sync + 'static,
    {
        self.dequeue_until(Arc::new(predicate), cancel.cancelled())
            .await
    }

    /// Like `dequeue_matching`, giving up after `timeout`.
    pub async fn dequeue_matching_within<P>(
        &self,
        predicate: P,
        timeout: Duration,
    ) -> Result<Option<(Q, T)>, SchedulerError>
    where
        P: Fn(&Q) -> bool + Send + Sync + 'static,
    {
        self.dequeue_until(Arc::new(predicate), time::sleep(timeout))
            .await
    }

    async fn dequeue_until<F>(
        &self,
        predicate: Predicate<Q>,
        stop: F,
    ) -> Result<Option<(Q, T)>, SchedulerError>
    where
        F: Future<Output = ()>,
    {
        if let Some(hit) = self.core.scan(&*predicate).await? {
            return Ok(Some(hit));
        }

        let (listener, delivery) = self.core.listeners.register(predicate.clone());
        let mut waiter = Waiter {
            core: self.core.clone(),
            listener,
            delivery,
        };

        // A task may have landed between the first scan and registration.
        match self.core.scan(&*predicate).await {
            Ok(Some(hit)) => return Ok(waiter.claim(hit).await),
            Ok(None) => {}
            Err(e) => {
                return match waiter.settle().await {
                    Some(delivered) => Ok(Some(delivered)),
                    None => Err(e),
                };
            }
        }

        let mut rescan = self
            .core
            .config
            .rescan_interval
            .map(|period| time::interval_at(Instant::now() + period, period));
        tokio::pin!(stop);

        loop {
            tokio::select! {
                delivered = &mut waiter.delivery => return Ok(delivered.ok()),
                _ = &mut stop => {
                    if let Some((queue, task)) = waiter.settle().await {
                        debug!(?queue, "dequeue cancelled after hand-off, pushing task back");
                        self.core.restore(&queue, task).await;
                    }
                    return Ok(None);
                }
                _ = tick(&mut rescan) => {
                    match self.core.scan(&*predicate).await {
                        Ok(Some(hit)) => return Ok(waiter.claim(hit).await),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "rescan for waiting dequeue failed"),
                    }
                }
            }
        }
    }

    /// Indexed queues nobody has drained within the staleness threshold.
    /// Stale heartbeats are evicted along the way; the index is untouched.
    pub async fn inactive_queues(&self) -> Result<Vec<Q>, SchedulerError> {
        let indexed = self.core.indexed().await?;
        let members: Vec<String> = indexed.iter().map(|(member, _)| member.clone()).collect();
        let heartbeats = self.core.store.heartbeats().await?;
        let result = tracker::staleness(
            &members,
            &heartbeats,
            Utc::now().timestamp_millis(),
            self.core.config.stale_after,
        );

        if !result.evict.is_empty() {
            debug!(count = result.evict.len(), "evicting stale queue heartbeats");
            self.core.store.forget(&result.evict).await?;
        }

        Ok(indexed
            .into_iter()
            .filter(|(member, _)| result.inactive.contains(member))
            .map(|(_, queue)| queue)
            .collect())
    }

    /// Total tasks waiting in indexed queues accepted by `predicate`.
    pub async fn queued_task_count<P>(&self, predicate: P) -> Result<u64, SchedulerError>
    where
        P: Fn(&Q) -> bool + Send + Sync,
    {
        let mut total = 0;
        for (member, queue) in self.core.indexed().await? {
            if accepts(&predicate, &queue) {
                total += self.core.store.len(&member).await?;
            }
        }
        Ok(total)
    }

    /// Dequeue calls currently suspended in this instance.
    pub fn listener_count(&self) -> usize {
        self.core.listeners.len()
    }

    /// Stop the dispatcher and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

impl<S, Q, T> Drop for Scheduler<S, Q, T>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
