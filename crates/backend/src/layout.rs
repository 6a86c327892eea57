//! On-disk layout of a bus root: queue, completed and error folders plus the
//! naming rules that tie a work file to its journal.

use std::{
  ffi::OsString,
  path::{Path, PathBuf},
};

use filebus_core::config::QueueConfig;
use glob::Pattern;

#[derive(Debug, Clone)]
pub struct QueueLayout {
  pub root: PathBuf,
  pub queue: PathBuf,
  pub completed: PathBuf,
  pub error: PathBuf,
  journal_extension: String,
  filter: Pattern,
}

impl QueueLayout {
  pub fn from_config(config: &QueueConfig) -> Result<Self, glob::PatternError> {
    Ok(Self {
      root: config.root_folder.clone(),
      queue: config.queue_path(),
      completed: config.completed_path(),
      error: config.error_path(),
      journal_extension: config.journal_extension.clone(),
      filter: Pattern::new(&config.filter)?,
    })
  }

  /// Create the queue, completed and error folders if missing
  pub fn ensure(&self) -> std::io::Result<()> {
    for dir in [&self.queue, &self.completed, &self.error] {
      std::fs::create_dir_all(dir)?;
    }
    Ok(())
  }

  pub fn journal_extension(&self) -> &str {
    &self.journal_extension
  }

  /// `<dir>/<name>` -> `<dir>/<name>.<ext>`
  pub fn journal_path(&self, work: &Path) -> PathBuf {
    let mut name = work.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(&self.journal_extension);
    work.with_file_name(name)
  }

  pub fn is_journal(&self, path: &Path) -> bool {
    path
      .extension()
      .and_then(|ext| ext.to_str())
      .is_some_and(|ext| ext == self.journal_extension)
  }

  /// Inverse of [`QueueLayout::journal_path`]
  pub fn work_path_for_journal(&self, journal: &Path) -> Option<PathBuf> {
    if !self.is_journal(journal) {
      return None;
    }
    Some(journal.with_extension(""))
  }

  /// True for files the filter selects, never for journals
  pub fn is_work_file(&self, path: &Path) -> bool {
    if self.is_journal(path) {
      return false;
    }
    path
      .file_name()
      .and_then(|name| name.to_str())
      .is_some_and(|name| self.filter.matches(name))
  }

  pub fn completed_file(&self, file_name: &str) -> PathBuf {
    self.completed.join(file_name)
  }

  pub fn error_file(&self, file_name: &str) -> PathBuf {
    self.error.join(file_name)
  }
}
