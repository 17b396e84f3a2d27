//! Ports - Trait definitions for collaborators of the scheduler.

pub mod store;

pub use store::{Popped, QueueStore, StoreError};

#[cfg(test)]
pub use store::MockQueueStore;
