//! Background task scheduling.
//!
//! [`TaskQueue`] orders queued work by priority, runs one task per tick, and
//! spaces the ticks adaptively: fast tasks shrink the delay toward a 10ms
//! floor, slow or failing tasks widen it up to a 10s ceiling. When the
//! backlog exceeds its configured capacity the least urgent task is evicted.

mod order;
mod queue;

pub use queue::{
    MAX_TIMEOUT_MS, MIN_TIMEOUT_MS, NoopQueueHeartbeat, QueueHeartbeat, QueueStats, TaskQueue,
};
pub use order::{TaskFn, TaskFuture};
