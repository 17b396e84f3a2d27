//! Adapters - Concrete implementations of ports.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use redis::RedisStore;
