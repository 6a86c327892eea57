use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use filebus_core::config::SweeperConfig;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
  backlog,
  handle::WorkQueue,
  message::{Observers, ProcessorEvent},
};
use crate::{
  journal::{Journal, JournalState, LockSet},
  layout::QueueLayout,
};

/// Re-posting of pending items during sweeps
#[derive(Debug, Clone)]
pub struct Rescan {
  pub queue: WorkQueue,
  pub max_attempts: u32,
}

/// Background cleanup of fully processed work items.
///
/// Runs on a randomized, self-rearming timer so that several instances sharing
/// a folder do not sweep in lockstep. Each pass:
/// - deletes processed work files, their companions and their journals
/// - optionally re-posts items still pending (e.g. skipped under contention)
pub struct Sweeper {
  layout: Arc<QueueLayout>,
  config: SweeperConfig,
  cleanup: Cleanup,
  rescan: Option<Rescan>,
  poke: Arc<Notify>,
}

/// State a cleanup pass needs, cloned onto the blocking pool
#[derive(Clone)]
struct Cleanup {
  layout: Arc<QueueLayout>,
  locks: LockSet,
  observers: Observers,
}

impl Sweeper {
  pub fn new(
    layout: Arc<QueueLayout>,
    config: SweeperConfig,
    locks: LockSet,
    observers: Observers,
    rescan: Option<Rescan>,
    poke: Arc<Notify>,
  ) -> Self {
    Self {
      cleanup: Cleanup {
        layout: layout.clone(),
        locks,
        observers,
      },
      layout,
      config,
      rescan,
      poke,
    }
  }

  /// Random interval in `[min_interval_ms, max_interval_ms]`
  pub fn next_interval(&self) -> Duration {
    let min = self.config.min_interval_ms;
    let max = self.config.max_interval_ms.max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
  }

  /// Run until cancelled. A poke runs a pass right away.
  pub async fn run(self, cancel: CancellationToken) {
    info!(
      auto_delete = self.config.auto_delete,
      rescan = self.rescan.is_some(),
      "Sweeper started"
    );

    loop {
      let wait = self.next_interval();
      tokio::select! {
          biased;

          _ = cancel.cancelled() => {
              info!("Sweeper shutting down (cancelled)");
              break;
          }

          _ = self.poke.notified() => {
              trace!("Sweep requested");
          }

          _ = tokio::time::sleep(wait) => {}
      }

      self.pass().await;
    }

    info!("Sweeper stopped");
  }

  /// One sweep: cleanup first, then the rescan
  pub async fn pass(&self) {
    if self.config.auto_delete {
      let cleanup = self.cleanup.clone();
      match tokio::task::spawn_blocking(move || cleanup.sweep()).await {
        Ok(0) => {}
        Ok(swept) => debug!(swept, "Swept processed work items"),
        Err(e) => warn!(error = %e, "Sweep pass panicked"),
      }
    }

    if let Some(rescan) = &self.rescan {
      backlog::scan(&self.layout, rescan.max_attempts, &rescan.queue).await;
    }
  }

  /// Delete every processed work item on the current thread; returns how many were removed
  pub fn sweep_once(&self) -> usize {
    self.cleanup.sweep()
  }
}

impl Cleanup {
  fn sweep(&self) -> usize {
    let entries = match std::fs::read_dir(&self.layout.queue) {
      Ok(entries) => entries,
      Err(e) => {
        warn!(dir = %self.layout.queue.display(), error = %e, "Failed to read queue folder");
        return 0;
      }
    };

    let journals: Vec<PathBuf> = entries
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| self.layout.is_journal(path))
      .collect();

    journals.iter().filter(|journal| self.sweep_item(journal)).count()
  }

  fn sweep_item(&self, journal_path: &Path) -> bool {
    let Some(work) = self.layout.work_path_for_journal(journal_path) else {
      return false;
    };

    let journal = match Journal::try_acquire(journal_path, &self.locks) {
      Ok(journal) => journal,
      Err(e) => {
        trace!(path = %journal_path.display(), error = %e, "Journal busy, not sweeping");
        return false;
      }
    };

    let processed = journal.last().is_some_and(|r| r.state == JournalState::Processed);
    if !processed {
      // Journal left behind by a work file that vanished before any attempt
      if journal.records().is_empty() && !work.exists() {
        journal.discard();
      }
      return false;
    }

    remove_quietly(&work);
    for companion in companions(&work).iter().filter(|c| c.as_path() != journal_path) {
      remove_quietly(companion);
    }

    let path = journal.release();
    remove_quietly(&path);

    debug!(path = %work.display(), "Processed work item removed");
    self.observers.emit(ProcessorEvent::Swept { path: work });
    true
  }
}

/// Files next to `work` named `<work name>.<anything>`
fn companions(work: &Path) -> Vec<PathBuf> {
  let (Some(dir), Some(name)) = (work.parent(), work.file_name().and_then(|n| n.to_str())) else {
    return Vec::new();
  };
  let prefix = format!("{}.", name);

  let Ok(entries) = std::fs::read_dir(dir) else {
    return Vec::new();
  };

  entries
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| {
      path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&prefix))
    })
    .filter(|path| path.is_file())
    .collect()
}

fn remove_quietly(path: &Path) {
  if let Err(e) = std::fs::remove_file(path)
    && e.kind() != std::io::ErrorKind::NotFound
  {
    debug!(path = %path.display(), error = %e, "Failed to remove file");
  }
}
