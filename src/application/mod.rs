//! Application layer - The scheduler and the machinery behind it.

mod dispatcher;
mod listeners;
pub mod scheduler;
mod tracker;

pub use scheduler::Scheduler;
