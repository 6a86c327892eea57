//! Startup reconciliation: queue work that arrived (or was left unfinished)
//! while no listener was watching.

use std::path::PathBuf;

use filebus_core::ChangeKind;
use tracing::{debug, info, warn};

use super::{handle::WorkQueue, message::WorkItem};
use crate::{
  journal::{self, JournalRecord, JournalState},
  layout::QueueLayout,
};

/// Whether a work item with this last journal record still needs the processor.
///
/// An unlocked journal ending in `Processing` is an interrupted attempt. It is
/// picked up even at the attempt limit so the item is moved to the error folder.
pub fn needs_processing(last: Option<&JournalRecord>, max_attempts: u32) -> bool {
  match last {
    None => true,
    Some(record) => match record.state {
      JournalState::Processed => false,
      JournalState::Processing => true,
      JournalState::Failed => record.attempt < max_attempts,
    },
  }
}

/// List pending work items in the queue folder, in name order.
///
/// Journals that are locked or unreadable are skipped; their owner (or a later
/// scan) deals with them.
pub fn pending_items(layout: &QueueLayout, max_attempts: u32) -> Vec<WorkItem> {
  let entries = match std::fs::read_dir(&layout.queue) {
    Ok(entries) => entries,
    Err(e) => {
      warn!(dir = %layout.queue.display(), error = %e, "Failed to read queue folder");
      return Vec::new();
    }
  };

  let mut files: Vec<PathBuf> = entries
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
    .map(|entry| entry.path())
    .filter(|path| layout.is_work_file(path))
    .collect();
  files.sort();

  files
    .into_iter()
    .filter_map(|path| {
      let journal_path = layout.journal_path(&path);
      match journal::read_last(&journal_path) {
        Ok(last) if needs_processing(last.as_ref(), max_attempts) => {
          let trigger = last.map(|r| r.trigger).unwrap_or(ChangeKind::Created);
          Some(WorkItem::new(path, trigger))
        }
        Ok(_) => None,
        Err(e) => {
          debug!(path = %path.display(), error = %e, "Skipping work item during scan");
          None
        }
      }
    })
    .collect()
}

/// Post every pending item; returns how many were newly queued
pub async fn scan(layout: &QueueLayout, max_attempts: u32, queue: &WorkQueue) -> usize {
  let owned = layout.clone();
  let items = match tokio::task::spawn_blocking(move || pending_items(&owned, max_attempts)).await {
    Ok(items) => items,
    Err(e) => {
      warn!(error = %e, "Backlog scan panicked");
      return 0;
    }
  };
  let found = items.len();

  let mut posted = 0;
  for item in items {
    match queue.post(item).await {
      Ok(true) => posted += 1,
      Ok(false) => {}
      Err(e) => {
        warn!(error = %e, "Backlog scan stopped, worker pool is gone");
        break;
      }
    }
  }

  if found > 0 {
    info!(found, posted, "Backlog scan queued pending work");
  } else {
    debug!("Backlog scan found nothing pending");
  }
  posted
}
