//! Configuration for the scheduler and its backing stores.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs of a scheduler instance.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// How long a locally recorded heartbeat is trusted before it is written
    /// through to the store again.
    pub refresh_window: Duration,
    /// Heartbeats older than this mark a queue as abandoned.
    pub stale_after: Duration,
    /// Listeners sampled per round when dispatching a new queue.
    pub dispatch_batch: usize,
    /// Interval at which a suspended dequeue scans again. `None` disables it.
    pub rescan_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(10),
            stale_after: Duration::from_secs(10 * 60),
            dispatch_batch: 10,
            rescan_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            refresh_window: env_secs("TASKMUX_REFRESH_WINDOW_SECS")
                .unwrap_or(defaults.refresh_window),
            stale_after: env_secs("TASKMUX_STALE_AFTER_SECS").unwrap_or(defaults.stale_after),
            dispatch_batch: env_parse("TASKMUX_DISPATCH_BATCH")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.dispatch_batch),
            rescan_interval: match env_secs("TASKMUX_RESCAN_SECS") {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => defaults.rescan_interval,
            },
        }
    }

    /// Map settings the scheduler cannot run with onto working ones: a batch
    /// of at least one listener, and no rescan for a zero period.
    pub fn normalized(self) -> Self {
        Self {
            dispatch_batch: self.dispatch_batch.max(1),
            rescan_interval: self.rescan_interval.filter(|period| !period.is_zero()),
            ..self
        }
    }
}

/// Connection settings for the Redis store.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix of every key and channel the scheduler touches
    pub namespace: String,
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| String::from("redis://127.0.0.1/")),
            namespace: env::var("TASKMUX_NAMESPACE").unwrap_or_else(|_| String::from("taskmux")),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
