//! Requeue command: give failed items a fresh set of attempts

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use filebus::{
  journal::{Journal, LockSet},
  layout::QueueLayout,
};
use filebus_core::{Config, peek_envelope_id};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RequeueReport {
  requeued: Vec<PathBuf>,
  /// Items whose journal is held by a running worker
  busy: Vec<String>,
  /// Requested ids with no file in the error folder
  unknown: Vec<String>,
}

pub fn cmd_requeue(config: &Config, ids: &[String]) -> Result<()> {
  let layout = QueueLayout::from_config(&config.queue).context("Invalid file filter")?;
  layout.ensure().context("Failed to create queue folders")?;

  let report = requeue(&layout, ids)?;

  for path in &report.requeued {
    println!("Requeued {}", path.display());
  }
  for name in &report.busy {
    println!("Skipped {} (in progress)", name);
  }
  for id in &report.unknown {
    println!("Not found in error folder: {}", id);
  }
  if report.requeued.is_empty() && report.busy.is_empty() && report.unknown.is_empty() {
    println!("Error folder is empty");
  }

  Ok(())
}

/// Move error copies back into the queue.
///
/// An error copy replaces the queue work file carrying the same envelope id,
/// whatever that file is called; the copy's own name is used only when no such
/// file is left. The target's journal is removed first, so the moved file is
/// picked up as new work with a fresh attempt count.
fn requeue(layout: &QueueLayout, ids: &[String]) -> Result<RequeueReport> {
  let mut report = RequeueReport::default();
  let locks = LockSet::new();

  let mut failed: Vec<PathBuf> = std::fs::read_dir(&layout.error)
    .with_context(|| format!("Failed to read {}", layout.error.display()))?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| path.is_file())
    .collect();
  failed.sort();

  if !ids.is_empty() {
    report.unknown = ids
      .iter()
      .filter(|id| !failed.iter().any(|path| matches_id(path, id)))
      .cloned()
      .collect();
    failed.retain(|path| ids.iter().any(|id| matches_id(path, id)));
  }

  let originals = work_files_by_id(layout)?;

  for source in failed {
    let Some(name) = source.file_name() else {
      continue;
    };
    let id = std::fs::read(&source).ok().and_then(|bytes| peek_envelope_id(&bytes));
    let target = id
      .and_then(|id| originals.get(&id).cloned())
      .unwrap_or_else(|| layout.queue.join(name));

    match Journal::try_acquire(&layout.journal_path(&target), &locks) {
      Ok(journal) => journal.discard(),
      Err(e) => {
        warn!(path = %target.display(), error = %e, "Journal busy, not requeueing");
        report.busy.push(name.to_string_lossy().into_owned());
        continue;
      }
    }

    std::fs::rename(&source, &target)
      .with_context(|| format!("Failed to move {} to {}", source.display(), target.display()))?;
    report.requeued.push(target);
  }

  Ok(report)
}

/// Work files in the queue folder keyed by the envelope id they carry
fn work_files_by_id(layout: &QueueLayout) -> Result<HashMap<Uuid, PathBuf>> {
  let entries = std::fs::read_dir(&layout.queue)
    .with_context(|| format!("Failed to read {}", layout.queue.display()))?;

  Ok(
    entries
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| path.is_file() && layout.is_work_file(path))
      .filter_map(|path| {
        let id = peek_envelope_id(&std::fs::read(&path).ok()?)?;
        Some((id, path))
      })
      .collect(),
  )
}

/// `id` names the file either in full or by its stem
fn matches_id(path: &Path, id: &str) -> bool {
  path.file_name().is_some_and(|n| n == id) || path.file_stem().is_some_and(|s| s == id)
}
