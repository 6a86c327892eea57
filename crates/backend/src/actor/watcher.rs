//! WatcherTask - Async directory watcher that feeds the work queue
//!
//! # Design
//!
//! The watcher bridges the sync notify callbacks with the async worker pool:
//! 1. notify's sync callback uses `blocking_send` to forward events to a channel
//! 2. The async task consumes events from that channel
//! 3. Events are classified into change kinds and filtered (enabled kinds,
//!    journals, file filter, directories, creation echoes)
//! 4. Surviving paths are posted to the [`WorkQueue`]
//!
//! # Debounce
//!
//! Writing a new file produces a create event followed by one or more modify
//! events. A `changed` event is that echo, and is dropped, when it arrives
//! within `change_debounce` of a create event seen for the same path, or when
//! the file's modification time is within `change_debounce` of its creation
//! time (files created before the watcher started).
//!
//! # Lifecycle
//!
//! The watcher runs until:
//! - The `CancellationToken` is triggered
//! - The event channel closes (notify watcher dropped)

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
  time::{Duration, Instant, SystemTime},
};

use filebus_core::{ChangeKind, Config};
use notify::{
  Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
  event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{handle::WorkQueue, message::WorkItem};
use crate::layout::QueueLayout;

/// Buffer between notify's thread and the async task
const EVENT_BUFFER: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct WatcherConfig {
  pub layout: Arc<QueueLayout>,
  /// Change kinds that are turned into work
  pub change_types: Vec<ChangeKind>,
  pub change_debounce: Duration,
  pub use_polling: bool,
  pub poll_interval: Duration,
}

impl WatcherConfig {
  pub fn from_config(config: &Config, layout: Arc<QueueLayout>) -> Self {
    Self {
      layout,
      change_types: config.queue.change_types.clone(),
      change_debounce: config.processor.change_debounce(),
      use_polling: config.processor.use_polling,
      poll_interval: config.processor.poll_interval(),
    }
  }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
  #[error("Queue folder does not exist: {0}")]
  MissingFolder(PathBuf),

  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

// ============================================================================
// Event Classification
// ============================================================================

/// Map a notify event onto the paths and change kinds it represents
pub(crate) fn classify(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
  let each = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> { event.paths.iter().map(|p| (p.clone(), kind)).collect() };

  match event.kind {
    EventKind::Create(_) => each(ChangeKind::Created),
    EventKind::Modify(ModifyKind::Name(mode)) => match mode {
      // paths[0] = from, paths[1] = to
      RenameMode::Both if event.paths.len() >= 2 => vec![
        (event.paths[0].clone(), ChangeKind::Deleted),
        (event.paths[1].clone(), ChangeKind::Renamed),
      ],
      RenameMode::To | RenameMode::Both => each(ChangeKind::Renamed),
      RenameMode::From => each(ChangeKind::Deleted),
      // Backends that cannot tell the direction (polling, some platforms)
      RenameMode::Any | RenameMode::Other => event
        .paths
        .iter()
        .map(|p| {
          let kind = if p.exists() {
            ChangeKind::Renamed
          } else {
            ChangeKind::Deleted
          };
          (p.clone(), kind)
        })
        .collect(),
    },
    EventKind::Modify(_) => each(ChangeKind::Changed),
    EventKind::Remove(_) => each(ChangeKind::Deleted),
    EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
  }
}

/// True when a modification is just the tail of the file's creation
pub(crate) fn is_creation_echo(created: Option<SystemTime>, modified: SystemTime, window: Duration) -> bool {
  match created {
    Some(created) => modified.duration_since(created).map(|d| d < window).unwrap_or(true),
    // Platform cannot report creation time
    None => false,
  }
}

// ============================================================================
// WatcherTask
// ============================================================================

/// Async directory watcher that posts work items
///
/// # Example
///
/// ```ignore
/// let watcher = WatcherTask::new(WatcherConfig::from_config(&config, layout), queue, cancel)?;
/// // backlog scan goes here, before events are consumed
/// tokio::spawn(watcher.run());
/// ```
pub struct WatcherTask {
  config: WatcherConfig,
  queue: WorkQueue,
  cancel: CancellationToken,
  // The notify watcher must be held to keep it alive
  _watcher: Box<dyn Watcher + Send>,
  // Channel receiving events from notify's sync callback
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  // Create events still inside the debounce window
  recent_creates: HashMap<PathBuf, Instant>,
}

impl WatcherTask {
  /// Create a new WatcherTask
  ///
  /// Starts watching immediately so nothing written during the backlog scan is
  /// missed. Events are buffered until `run()` is called.
  pub fn new(config: WatcherConfig, queue: WorkQueue, cancel: CancellationToken) -> Result<Self, WatcherError> {
    let root = config.layout.queue.clone();
    if !root.is_dir() {
      return Err(WatcherError::MissingFolder(root));
    }

    info!(root = %root.display(), polling = config.use_polling, "Initializing queue watcher");

    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(EVENT_BUFFER);
    let handler = move |res: notify::Result<Event>| {
      // This runs on notify's thread - use blocking_send
      let _ = event_tx.blocking_send(res);
    };

    let notify_config = notify::Config::default().with_poll_interval(config.poll_interval);
    let mut watcher: Box<dyn Watcher + Send> = if config.use_polling {
      Box::new(PollWatcher::new(handler, notify_config).map_err(WatcherError::Init)?)
    } else {
      Box::new(RecommendedWatcher::new(handler, notify_config).map_err(WatcherError::Init)?)
    };

    watcher
      .watch(&root, RecursiveMode::NonRecursive)
      .map_err(WatcherError::Watch)?;

    Ok(Self {
      config,
      queue,
      cancel,
      _watcher: watcher,
      event_rx,
      recent_creates: HashMap::new(),
    })
  }

  /// Run the watcher task
  ///
  /// This consumes the task and runs until:
  /// - The `CancellationToken` is triggered
  /// - The event channel closes
  pub async fn run(mut self) {
    info!(root = %self.config.layout.queue.display(), "WatcherTask started");

    loop {
      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              info!("WatcherTask shutting down (cancelled)");
              break;
          }

          event = self.event_rx.recv() => {
              match event {
                  Some(Ok(event)) => {
                      for item in self.accept(&event) {
                          tokio::select! {
                              biased;
                              _ = self.cancel.cancelled() => break,
                              posted = self.queue.post(item) => {
                                  if let Err(e) = posted {
                                      warn!(error = %e, "Failed to queue work item");
                                  }
                              }
                          }
                      }
                  }
                  Some(Err(e)) => {
                      warn!(error = %e, "Watcher error");
                  }
                  None => {
                      info!("WatcherTask shutting down (channel closed)");
                      break;
                  }
              }
          }
      }
    }

    info!(root = %self.config.layout.queue.display(), "WatcherTask stopped");
  }

  /// Filter one notify event down to the work items it should produce
  fn accept(&mut self, event: &Event) -> Vec<WorkItem> {
    classify(event)
      .into_iter()
      .filter_map(|(path, kind)| self.accept_path(path, kind))
      .collect()
  }

  fn accept_path(&mut self, path: PathBuf, kind: ChangeKind) -> Option<WorkItem> {
    if !self.config.change_types.contains(&kind) {
      trace!(path = %path.display(), %kind, "Change kind not enabled");
      return None;
    }

    if !self.config.layout.is_work_file(&path) {
      trace!(path = %path.display(), "Skipping journal or filtered file");
      return None;
    }

    if kind != ChangeKind::Deleted && path.is_dir() {
      trace!(path = %path.display(), "Skipping directory event");
      return None;
    }

    if kind == ChangeKind::Created {
      self.note_create(&path);
    }

    if kind == ChangeKind::Changed && self.is_echo(&path) {
      trace!(path = %path.display(), "Skipping change right after creation");
      return None;
    }

    debug!(path = %path.display(), %kind, "Work item detected");
    Some(WorkItem::new(path, kind))
  }

  fn note_create(&mut self, path: &Path) {
    let window = self.config.change_debounce;
    if window.is_zero() {
      return;
    }
    self.recent_creates.retain(|_, seen| seen.elapsed() < window);
    self.recent_creates.insert(path.to_path_buf(), Instant::now());
  }

  fn is_echo(&self, path: &Path) -> bool {
    if let Some(seen) = self.recent_creates.get(path)
      && seen.elapsed() < self.config.change_debounce
    {
      return true;
    }

    let Ok(meta) = std::fs::metadata(path) else {
      return false;
    };
    let Ok(modified) = meta.modified() else {
      return false;
    };
    is_creation_echo(meta.created().ok(), modified, self.config.change_debounce)
  }
}
