//! Domain layer - Queue identifiers, payloads and their store encoding.

pub mod queue;

pub use queue::{Payload, QueueKey};
