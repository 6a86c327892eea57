//! Status command: work items with their last journal state

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use filebus::{
  journal::{self, JournalError, JournalState},
  layout::QueueLayout,
};
use filebus_core::Config;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemStatus {
  file: String,
  /// pending, processing, processed, failed, exhausted, active or unreadable
  state: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  attempt: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  instance_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BusStatus {
  root: PathBuf,
  items: Vec<ItemStatus>,
  completed: usize,
  errors: Vec<String>,
}

pub fn cmd_status(config: &Config, json: bool) -> Result<()> {
  let layout = QueueLayout::from_config(&config.queue).context("Invalid file filter")?;
  let status = collect_status(&layout, config.processor.max_attempts)?;

  if json {
    println!("{}", serde_json::to_string_pretty(&status)?);
    return Ok(());
  }

  println!("Bus root: {}", status.root.display());
  println!();

  println!("Queue: {} item(s)", status.items.len());
  if !status.items.is_empty() {
    println!("  {:<12} {:>7}  {:<20} {:<20} FILE", "STATE", "ATTEMPT", "UPDATED", "INSTANCE");
    for item in &status.items {
      println!(
        "  {:<12} {:>7}  {:<20} {:<20} {}",
        item.state,
        item.attempt.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
        item
          .updated
          .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
          .unwrap_or_else(|| "-".into()),
        item.instance_id.as_deref().unwrap_or("-"),
        item.file
      );
    }
  }
  println!();

  println!("Completed: {}", status.completed);
  println!("Errors:    {}", status.errors.len());
  for name in &status.errors {
    println!("  - {}", name);
  }

  Ok(())
}

fn collect_status(layout: &QueueLayout, max_attempts: u32) -> Result<BusStatus> {
  let work_files: Vec<PathBuf> = list_files(&layout.queue)?
    .into_iter()
    .filter(|path| layout.is_work_file(path))
    .collect();

  let items = work_files
    .iter()
    .map(|path| item_status(layout, path, max_attempts))
    .collect();

  Ok(BusStatus {
    root: layout.root.clone(),
    items,
    completed: list_files(&layout.completed)?.len(),
    errors: list_files(&layout.error)?.iter().map(|p| file_name(p)).collect(),
  })
}

fn item_status(layout: &QueueLayout, path: &Path, max_attempts: u32) -> ItemStatus {
  let mut status = ItemStatus {
    file: file_name(path),
    state: "pending".into(),
    attempt: None,
    instance_id: None,
    updated: None,
  };

  match journal::read_last(&layout.journal_path(path)) {
    Ok(None) => {}
    Ok(Some(record)) => {
      status.state = if record.state == JournalState::Failed && record.attempt >= max_attempts {
        "exhausted".into()
      } else {
        record.state.as_str().into()
      };
      status.attempt = Some(record.attempt);
      status.instance_id = Some(record.instance_id);
      status.updated = Some(record.timestamp);
    }
    // A worker holds the journal right now
    Err(JournalError::Contended(_)) => status.state = "active".into(),
    Err(_) => status.state = "unreadable".into(),
  }

  status
}

/// Regular files in `dir`, sorted; a missing folder is empty
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let entries = match std::fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
  };

  let mut files: Vec<PathBuf> = entries
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
    .map(|entry| entry.path())
    .collect();
  files.sort();
  Ok(files)
}

fn file_name(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default()
}
