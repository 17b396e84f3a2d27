//! End-to-end scheduler behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use taskmux::{CancellationToken, MemoryStore, QueueStore, Scheduler, SchedulerConfig};
use tokio::time::{sleep, timeout, Instant};

type TestScheduler = Scheduler<MemoryStore, String, String>;

fn no_rescan() -> SchedulerConfig {
    SchedulerConfig {
        rescan_interval: None,
        ..SchedulerConfig::default()
    }
}

async fn start(store: &MemoryStore, config: SchedulerConfig) -> Arc<TestScheduler> {
    Arc::new(Scheduler::start(store.clone(), config).await.unwrap())
}

async fn wait_for_listeners(scheduler: &TestScheduler, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while scheduler.listener_count() != count {
        assert!(Instant::now() < deadline, "listeners never reached {}", count);
        sleep(Duration::from_millis(5)).await;
    }
}

fn only(name: &'static str) -> impl Fn(&String) -> bool + Send + Sync + 'static {
    move |queue: &String| queue == name
}

fn id(name: &str) -> String {
    name.to_string()
}

#[tokio::test]
async fn test_waiting_dequeue_woken_by_new_queue() {
    let store = MemoryStore::new();
    let scheduler = start(&store, no_rescan()).await;

    let waiter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            scheduler.dequeue_matching(only("pool-a"), &cancel).await
        })
    };
    wait_for_listeners(&scheduler, 1).await;

    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    let got = timeout(Duration::from_millis(100), waiter)
        .await
        .expect("waiter not woken by broadcast")
        .unwrap()
        .unwrap();

    assert_eq!(got, Some((id("pool-a"), id("t1"))));
    assert_eq!(scheduler.listener_count(), 0);
    assert_eq!(scheduler.queued_task_count(|_| true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_one_task_two_waiters() {
    let store = MemoryStore::new();
    let scheduler = start(&store, no_rescan()).await;
    let cancel = CancellationToken::new();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.dequeue_matching(only("pool-a"), &cancel).await })
        })
        .collect();
    wait_for_listeners(&scheduler, 2).await;

    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    wait_for_listeners(&scheduler, 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.listener_count(), 1);

    cancel.cancel();
    let mut results = Vec::new();
    for waiter in waiters {
        results.push(waiter.await.unwrap().unwrap());
    }

    let served: Vec<_> = results.iter().flatten().collect();
    assert_eq!(served, vec![&(id("pool-a"), id("t1"))]);
    assert_eq!(scheduler.listener_count(), 0);
}

#[tokio::test]
async fn test_cancelled_dequeue_returns_none_and_unregisters() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;
    let cancel = CancellationToken::new();

    let waiter = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.dequeue_matching(only("pool-a"), &cancel).await })
    };
    wait_for_listeners(&scheduler, 1).await;

    cancel.cancel();
    let got = timeout(Duration::from_millis(100), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(scheduler.listener_count(), 0);
}

#[tokio::test]
async fn test_dequeue_within_times_out() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    let got = scheduler
        .dequeue_matching_within(only("pool-a"), Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(scheduler.listener_count(), 0);
}

#[tokio::test]
async fn test_aborted_dequeue_leaves_no_listener() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    let waiter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            scheduler.dequeue_matching(only("pool-a"), &cancel).await
        })
    };
    wait_for_listeners(&scheduler, 1).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(scheduler.listener_count(), 0);

    // Nothing consumes the task now.
    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.queued_task_count(|_| true).await.unwrap(), 1);
}

#[tokio::test]
async fn test_fifo_within_queue() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    for n in 0..5 {
        scheduler
            .enqueue(&id("pool-a"), &format!("t{}", n), false)
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    for n in 0..5 {
        let (queue, task) = scheduler
            .dequeue_matching(only("pool-a"), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue, "pool-a");
        assert_eq!(task, format!("t{}", n));
    }
    assert!(!store.is_indexed("\"pool-a\""));
}

#[tokio::test]
async fn test_enqueue_at_front() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    scheduler.enqueue(&id("pool-a"), &id("urgent"), true).await.unwrap();

    assert_eq!(
        scheduler.dequeue(&id("pool-a")).await.unwrap(),
        Some(id("urgent"))
    );
    assert_eq!(scheduler.dequeue(&id("pool-a")).await.unwrap(), Some(id("t1")));
    assert_eq!(scheduler.dequeue(&id("pool-a")).await.unwrap(), None);
}

#[tokio::test]
async fn test_predicate_selects_queue() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    scheduler.enqueue(&id("pool-a"), &id("a1"), false).await.unwrap();
    scheduler.enqueue(&id("pool-b"), &id("b1"), false).await.unwrap();

    let got = scheduler
        .dequeue_matching_within(only("pool-b"), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(got, Some((id("pool-b"), id("b1"))));

    let none = scheduler
        .dequeue_matching_within(only("pool-b"), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(none, None);
    assert_eq!(scheduler.queued_task_count(only("pool-a")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_panicking_predicate_does_not_stall_dispatch() {
    let store = MemoryStore::new();
    let scheduler = start(&store, no_rescan()).await;
    let cancel = CancellationToken::new();

    let faulty = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            scheduler
                .dequeue_matching(|_: &String| -> bool { panic!("broken predicate") }, &cancel)
                .await
        })
    };
    wait_for_listeners(&scheduler, 1).await;
    let healthy = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.dequeue_matching(only("pool-a"), &cancel).await })
    };
    wait_for_listeners(&scheduler, 2).await;

    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    let got = timeout(Duration::from_secs(1), healthy)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, Some((id("pool-a"), id("t1"))));

    cancel.cancel();
    assert_eq!(faulty.await.unwrap().unwrap(), None);
}

#[tokio::test]
async fn test_repeated_enqueue_indexes_and_announces_once() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;
    let mut announcements = store.subscribe_new_queues().await.unwrap();

    for n in 0..3 {
        scheduler
            .enqueue(&id("pool-a"), &format!("t{}", n), false)
            .await
            .unwrap();
    }

    assert_eq!(store.queues().await.unwrap(), vec![id("\"pool-a\"")]);
    assert_eq!(announcements.next().await.unwrap().unwrap(), "\"pool-a\"");
    assert!(timeout(Duration::from_millis(50), announcements.next())
        .await
        .is_err());
}

#[tokio::test]
async fn test_burst_after_queue_birth_serves_every_waiter() {
    let store = MemoryStore::new();
    let config = SchedulerConfig {
        rescan_interval: Some(Duration::from_millis(50)),
        ..SchedulerConfig::default()
    };
    let scheduler = start(&store, config).await;
    let cancel = CancellationToken::new();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.dequeue_matching(only("pool-a"), &cancel).await })
        })
        .collect();
    wait_for_listeners(&scheduler, 3).await;

    for n in 0..3 {
        scheduler
            .enqueue(&id("pool-a"), &format!("t{}", n), false)
            .await
            .unwrap();
    }

    let mut tasks = HashSet::new();
    for waiter in waiters {
        let (_, task) = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        tasks.insert(task);
    }
    assert_eq!(tasks, HashSet::from([id("t0"), id("t1"), id("t2")]));
}

#[tokio::test]
async fn test_waiter_on_other_instance_is_served() {
    let store = MemoryStore::new();
    let producer = start(&store, no_rescan()).await;
    let consumer = start(&store, no_rescan()).await;

    let waiter = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            consumer.dequeue_matching(only("pool-a"), &cancel).await
        })
    };
    wait_for_listeners(&consumer, 1).await;

    producer.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
    let got = timeout(Duration::from_millis(500), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, Some((id("pool-a"), id("t1"))));
}

#[tokio::test]
async fn test_inactive_queues() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    scheduler.enqueue(&id("pool-b"), &id("b1"), false).await.unwrap();
    scheduler.enqueue(&id("pool-b"), &id("b2"), false).await.unwrap();
    assert_eq!(scheduler.inactive_queues().await.unwrap(), vec![id("pool-b")]);

    assert!(scheduler.dequeue(&id("pool-b")).await.unwrap().is_some());
    assert!(scheduler.inactive_queues().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_heartbeats_are_evicted() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    scheduler.enqueue(&id("pool-c"), &id("c1"), false).await.unwrap();
    store.set_heartbeat("\"pool-c\"", 0);
    store.set_heartbeat("\"retired\"", 0);

    assert_eq!(scheduler.inactive_queues().await.unwrap(), vec![id("pool-c")]);
    assert!(store.heartbeats().await.unwrap().is_empty());
    assert!(store.is_indexed("\"pool-c\""));
}

#[tokio::test]
async fn test_queued_task_count_is_read_only() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    for n in 0..3 {
        scheduler
            .enqueue(&id("linux-x64"), &format!("l{}", n), false)
            .await
            .unwrap();
    }
    scheduler.enqueue(&id("windows-x64"), &id("w0"), false).await.unwrap();

    let linux = |queue: &String| queue.starts_with("linux");
    assert_eq!(scheduler.queued_task_count(linux).await.unwrap(), 3);
    assert_eq!(scheduler.queued_task_count(|_| true).await.unwrap(), 4);
    assert_eq!(scheduler.queued_task_count(linux).await.unwrap(), 3);
    assert!(store.heartbeats().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_outage_is_reported() {
    let store = MemoryStore::new();
    let scheduler = start(&store, SchedulerConfig::default()).await;

    store.set_available(false);
    let err = scheduler
        .enqueue(&id("pool-a"), &id("t1"), false)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    store.set_available(true);
    scheduler.enqueue(&id("pool-a"), &id("t1"), false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_task_lost_under_concurrency() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;
    const QUEUES: [&str; 3] = ["pool-a", "pool-b", "pool-c"];

    let store = MemoryStore::new();
    let config = SchedulerConfig {
        rescan_interval: Some(Duration::from_millis(20)),
        ..SchedulerConfig::default()
    };
    let instances = [start(&store, config.clone()).await, start(&store, config).await];
    let done = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(Vec::new()));

    let consumers: Vec<_> = (0..6)
        .map(|n| {
            let scheduler = instances[n % 2].clone();
            let done = done.clone();
            let received = received.clone();
            let accepted = QUEUES[n % QUEUES.len()];
            tokio::spawn(async move {
                loop {
                    let next = scheduler
                        .dequeue_matching_within(
                            move |queue: &String| queue == accepted,
                            Duration::from_millis(200),
                        )
                        .await
                        .unwrap();
                    match next {
                        Some((queue, task)) => {
                            assert_eq!(queue, accepted);
                            received.lock().unwrap().push(task);
                        }
                        None if done.load(Ordering::SeqCst) => break,
                        None => {}
                    }
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let scheduler = instances[p % 2].clone();
            tokio::spawn(async move {
                for n in 0..PER_PRODUCER {
                    let queue = QUEUES[(p + n) % QUEUES.len()].to_string();
                    scheduler
                        .enqueue(&queue, &format!("{}-{}", p, n), false)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for consumer in consumers {
        consumer.await.unwrap();
    }

    // A consumer may give up right before a late task lands; collect those.
    for queue in QUEUES {
        while let Some(task) = instances[0].dequeue(&queue.to_string()).await.unwrap() {
            received.lock().unwrap().push(task);
        }
    }

    let received = received.lock().unwrap();
    let unique: HashSet<_> = received.iter().cloned().collect();
    assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(instances[0].queued_task_count(|_| true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_zero_rescan_period_means_no_rescan() {
    let store = MemoryStore::new();
    let config = SchedulerConfig {
        rescan_interval: Some(Duration::ZERO),
        ..SchedulerConfig::default()
    };
    let scheduler = start(&store, config).await;

    let got = scheduler
        .dequeue_matching_within(|_| true, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(scheduler.listener_count(), 0);
}

#[tokio::test]
async fn test_zero_dispatch_batch_still_wakes_waiter() {
    let store = MemoryStore::new();
    let config = SchedulerConfig {
        dispatch_batch: 0,
        rescan_interval: None,
        ..SchedulerConfig::default()
    };
    let scheduler = start(&store, config).await;

    let waiter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            scheduler.dequeue_matching(only("a"), &cancel).await
        })
    };
    wait_for_listeners(&scheduler, 1).await;

    scheduler.enqueue(&id("a"), &id("t"), false).await.unwrap();
    let got = timeout(Duration::from_millis(500), waiter)
        .await
        .expect("waiter not woken")
        .unwrap()
        .unwrap();
    assert_eq!(got, Some((id("a"), id("t"))));
}

#[tokio::test]
async fn test_queue_indexed_under_equivalent_json_is_drained() {
    let store = MemoryStore::new();
    let scheduler = start(&store, no_rescan()).await;

    // Written by a producer that spaces its JSON differently.
    let member = " \"pool-a\"";
    assert!(store.create_and_push(member, "\"t1\"", false).await.unwrap());

    let got = scheduler
        .dequeue_matching_within(only("pool-a"), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(got, Some((id("pool-a"), id("t1"))));
    assert!(!store.is_indexed(member));
    assert_eq!(store.len(member).await.unwrap(), 0);
}
