//! Core engine for the Curio asset manager.
//!
//! Two subsystems cooperate to keep asset indexing responsive without
//! starving the host application:
//!
//! - [`tasks`]: a priority task queue that runs one job at a time and adapts
//!   its pacing to observed execution cost.
//! - [`watch`]: a hybrid filesystem watcher that uses native notification on
//!   local mounts and snapshot-diff polling on network shares.
//!
//! A typical host wires the two together by subscribing a watch observer
//! that pushes re-index jobs onto the queue:
//!
//! ```no_run
//! use std::sync::Arc;
//! use curio_core::config::EngineConfig;
//! use curio_core::tasks::TaskQueue;
//! use curio_core::watch::{HybridWatcher, WatchEvent, WatchObserver};
//!
//! struct Reindexer(TaskQueue);
//!
//! impl WatchObserver for Reindexer {
//!     fn on_events(&self, events: &[WatchEvent]) {
//!         for event in events {
//!             let path = event.path.clone();
//!             let _ = self.0.push_background(move || async move {
//!                 tracing::info!(path = %path.display(), "reindexing");
//!                 Ok(())
//!             });
//!         }
//!     }
//! }
//!
//! # async fn run() -> curio_core::error::Result<()> {
//! let config = EngineConfig::default();
//! let queue = TaskQueue::new(config.queue);
//! queue.start(0, false);
//! let watcher = HybridWatcher::new(config.watch);
//! let _subscription = watcher.subscribe(Arc::new(Reindexer(queue)));
//! watcher.watch("/srv/assets").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod tasks;
pub mod watch;

pub use config::{EngineConfig, QueueConfig, WatchConfig};
pub use error::{EngineError, Result};
pub use tasks::TaskQueue;
pub use watch::{HybridWatcher, Subscription, WatchEvent, WatchEventKind, WatchObserver};
