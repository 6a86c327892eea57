//! Task-based queue engine
//!
//! Each component runs as a long-lived tokio task and talks to the others
//! through channels; the only shared state is the in-process journal lock set.
//!
//! # Tasks
//!
//! - [`WatcherTask`]: watches the queue folder and posts work items
//! - [`WorkerPool`]: N workers draining the queue through a [`WorkProcessor`]
//! - [`Sweeper`]: deletes processed items on a randomized timer, re-posts pending ones
//!
//! ```text
//! notify ─► WatcherTask ─┐
//!                        ├─► WorkQueue ─► WorkerPool ─► Dispatcher ─► handlers
//! backlog::scan ─────────┘                    │
//!                                             └─ poke ─► Sweeper
//! ```
//!
//! All tasks stop when the shared `CancellationToken` is cancelled.

pub mod backlog;
pub mod handle;
pub mod message;
pub mod pool;
pub mod processor;
pub mod sweeper;
pub mod watcher;


pub use handle::{SendError, WorkQueue, WorkReceiver, work_queue};
pub use message::{Observers, Outcome, ProcessorEvent, SkipReason, WorkItem};
pub use pool::WorkerPool;
pub use processor::{ProcessorSettings, WorkProcessor};
pub use sweeper::{Rescan, Sweeper};
pub use watcher::{WatcherConfig, WatcherError, WatcherTask};
