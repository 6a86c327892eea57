//! Message types flowing between the watcher, the worker pool and observers.
//!
//! ```text
//! notify → WatcherTask ─┐
//!                       ├─ WorkItem → WorkQueue → workers → ProcessorEvent → observers
//! backlog scan ─────────┘
//! ```

use std::path::PathBuf;

use filebus_core::ChangeKind;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the observer channel; slow observers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Work Items
// ============================================================================

/// A work file plus the change that surfaced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
  pub path: PathBuf,
  pub trigger: ChangeKind,
}

impl WorkItem {
  pub fn new(path: impl Into<PathBuf>, trigger: ChangeKind) -> Self {
    Self {
      path: path.into(),
      trigger,
    }
  }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Why a work item was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// Last record is `processed` and the trigger does not ask for a content check
  AlreadyProcessed,
  /// `changed` trigger, but the work file's mtime matches the processed record
  Unchanged,
  /// Every allowed attempt was already used
  Exhausted,
  /// The work file no longer exists
  Missing,
  /// A `deleted` trigger; reported, never dispatched
  Deleted,
  /// Shutdown was requested before or between attempts
  Cancelled,
  /// The journal could not be written
  JournalUnavailable,
}

/// Result of handing one work item to the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Processed { id: Uuid, attempt: u32 },
  Exhausted { attempts: u32 },
  Skipped(SkipReason),
  /// Another worker or instance holds the journal
  Contended,
}

// ============================================================================
// Observer Events
// ============================================================================

/// Progress notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
  Enqueued { path: PathBuf, trigger: ChangeKind },
  Contended { path: PathBuf },
  Skipped { path: PathBuf, reason: SkipReason },
  AttemptStarted { path: PathBuf, attempt: u32 },
  AttemptFailed { path: PathBuf, attempt: u32, error: String },
  Processed { path: PathBuf, id: Uuid, attempt: u32 },
  Exhausted { path: PathBuf, attempts: u32 },
  Swept { path: PathBuf },
}

/// Fan-out of [`ProcessorEvent`]s; emitting without subscribers is a no-op
#[derive(Debug, Clone)]
pub struct Observers {
  tx: broadcast::Sender<ProcessorEvent>,
}

impl Observers {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: ProcessorEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for Observers {
  fn default() -> Self {
    Self::new()
  }
}
