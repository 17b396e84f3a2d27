//! Queue Monitor Binary
//!
//! Periodically reports queue depth and queues nobody is draining, for
//! alerting and capacity planning. It never pops a task.
//!
//! Environment Variables:
//! - REDIS_URL: Redis connection URL
//! - TASKMUX_NAMESPACE: key namespace shared with producers and workers
//! - TASKMUX_STALE_AFTER_SECS: heartbeat age after which a queue is inactive
//! - TASKMUX_MONITOR_INTERVAL_SECS: seconds between reports (default 60)

use std::time::Duration;
use taskmux::{RedisConfig, RedisStore, Scheduler, SchedulerConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let redis_config = RedisConfig::from_env();
    let config = SchedulerConfig::from_env();
    let interval = std::env::var("TASKMUX_MONITOR_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    // 1. Store adapter
    let store = match RedisStore::new(&redis_config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to set up Redis store");
            std::process::exit(1);
        }
    };

    // 2. Scheduler over raw JSON queue ids, so ids of any shape are reported
    let scheduler: Scheduler<RedisStore, serde_json::Value, serde_json::Value> =
        match Scheduler::start(store, config).await {
            Ok(scheduler) => scheduler,
            Err(e) => {
                error!(error = %e, "failed to start scheduler");
                std::process::exit(1);
            }
        };
    info!(namespace = %redis_config.namespace, ?interval, "queue monitor started");

    // 3. Report loop
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        match scheduler.queued_task_count(|_| true).await {
            Ok(total) => info!(total, "queued tasks"),
            Err(e) => warn!(error = %e, "failed to count queued tasks"),
        }
        match scheduler.inactive_queues().await {
            Ok(inactive) => {
                for queue in &inactive {
                    warn!(%queue, "queue has tasks but no active consumer");
                }
                info!(count = inactive.len(), "inactive queues");
            }
            Err(e) => warn!(error = %e, "failed to list inactive queues"),
        }
    }

    scheduler.shutdown().await;
}
