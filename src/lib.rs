//! Taskmux - Distributed multi-queue task scheduler
//!
//! Producers enqueue tasks under a queue id. Consumers dequeue with a
//! predicate over queue ids and get a task from any matching non-empty
//! queue, or wait for one without polling.
//!
//! Hexagonal Architecture:
//! - domain/: Queue id and payload bounds, store encoding
//! - ports/: Backing store trait
//! - adapters/: Concrete stores (in-memory, Redis)
//! - application/: Scheduler, listener dispatch, active-queue tracking
//! - config: Environment configuration
//!
//! # Features
//! - `redis` (default): Redis-backed store and the `queue-monitor` binary

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use adapters::MemoryStore;
pub use application::Scheduler;
pub use config::{RedisConfig, SchedulerConfig};
pub use error::SchedulerError;
pub use ports::{QueueStore, StoreError};

#[cfg(feature = "redis")]
pub use adapters::RedisStore;

pub use tokio_util::sync::CancellationToken;
