//! Redis adapter.
//!
//! This module provides the Redis-backed implementation of `QueueStore`:
//! - one list per queue, pushed with `RPUSH`/`LPUSH`, popped with `LPOP`
//! - the queue index as a set, guarded by `WATCH` on the queue key
//! - heartbeats in a hash
//! - new-queue announcements over `PUBLISH`/`SUBSCRIBE`

mod error;
mod store;

pub use store::RedisStore;

/// Redis key layout under a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Keys {
    index: String,
    active: String,
    channel: String,
    queue_prefix: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self {
            index: format!("{}:queues", namespace),
            active: format!("{}:active", namespace),
            channel: format!("{}:new-queues", namespace),
            queue_prefix: format!("{}:queue:", namespace),
        }
    }

    fn queue(&self, member: &str) -> String {
        format!("{}{}", self.queue_prefix, member)
    }
}
