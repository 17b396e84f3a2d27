//! Hands tasks of newly created queues straight to local waiters.
//!
//! One forwarding loop drains the store subscription into an unbounded
//! channel; one dispatch loop drains that channel, folding bursts of
//! announcements into distinct queues before matching them to listeners.

use super::scheduler::Core;
use crate::domain::queue::decode;
use crate::domain::{Payload, QueueKey};
use crate::ports::{QueueStore, StoreError};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type Announcements = BoxStream<'static, Result<String, StoreError>>;

pub(crate) fn spawn<S, Q, T>(
    core: Arc<Core<S, Q, T>>,
    subscription: Announcements,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        tokio::join!(
            forward(&core.store, subscription, tx, &shutdown),
            drain(&*core, rx, &shutdown),
        );
        debug!("dispatcher stopped");
    })
}

async fn forward<S: QueueStore>(
    store: &S,
    mut announcements: Announcements,
    tx: mpsc::UnboundedSender<String>,
    shutdown: &CancellationToken,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            next = announcements.next() => match next {
                Some(Ok(queue)) => {
                    backoff = MIN_BACKOFF;
                    if tx.send(queue).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "unreadable new-queue announcement"),
                None => {
                    warn!("new-queue subscription lost, resubscribing");
                    match resubscribe(store, shutdown, &mut backoff).await {
                        Some(fresh) => announcements = fresh,
                        None => return,
                    }
                }
            }
        }
    }
}

async fn resubscribe<S: QueueStore>(
    store: &S,
    shutdown: &CancellationToken,
    backoff: &mut Duration,
) -> Option<Announcements> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(*backoff) => {}
        }
        match store.subscribe_new_queues().await {
            Ok(announcements) => {
                info!("resubscribed to new-queue announcements");
                return Some(announcements);
            }
            Err(e) => {
                *backoff = (*backoff * 2).min(MAX_BACKOFF);
                let retry_in = *backoff;
                warn!(error = %e, ?retry_in, "resubscribe failed");
            }
        }
    }
}

async fn drain<S, Q, T>(
    core: &Core<S, Q, T>,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: &CancellationToken,
) where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = rx.recv() => match next {
                Some(queue) => queue,
                None => return,
            },
        };

        let mut burst = vec![first];
        while let Ok(queue) = rx.try_recv() {
            if !burst.contains(&queue) {
                burst.push(queue);
            }
        }

        for member in burst {
            match decode::<Q>(&member) {
                Ok(queue) => dispatch(core, &member, &queue).await,
                Err(e) => debug!(queue = %member, error = %e, "ignoring foreign queue id"),
            }
        }
    }
}

/// Offer the tasks of `queue` to matching listeners until either runs out.
/// `member` is the queue id as announced, used verbatim for popping.
async fn dispatch<S, Q, T>(core: &Core<S, Q, T>, member: &str, queue: &Q)
where
    S: QueueStore,
    Q: QueueKey,
    T: Payload,
{
    let mut checked = HashSet::new();
    loop {
        let batch = core.listeners.sample(&checked, core.config.dispatch_batch);
        if batch.is_empty() {
            return;
        }

        let candidate = batch.into_iter().find(|listener| {
            checked.insert(listener.id());
            listener.accepts(queue)
        });
        let Some(listener) = candidate else {
            continue;
        };

        let task = match core.pop_member(member).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(?queue, error = %e, "pop for waiting listener failed");
                return;
            }
        };

        match listener.deliver(queue.clone(), task) {
            Ok(()) => debug!(?queue, listener = listener.id(), "handed task to waiting listener"),
            Err((_, task)) => {
                debug!(
                    ?queue,
                    listener = listener.id(),
                    "listener resolved first, pushing task back"
                );
                core.restore(queue, task).await;
            }
        }
    }
}
