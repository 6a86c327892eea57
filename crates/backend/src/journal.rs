//! Per-work-item status journal.
//!
//! Every work file `<name>` has a sibling `<name>.<ext>` holding one JSON record
//! per line. Records are only ever appended; the last well-formed line is the
//! current state. The open journal file also serves as the cross-instance lock
//! for its work item: whoever holds the exclusive lock owns the item.
//!
//! ```text
//! {"state":"processing","timestamp":"...","lastWrite":"...","trigger":"created","instanceId":"4711","attempt":1}
//! {"state":"failed","timestamp":"...","lastWrite":"...","trigger":"created","instanceId":"4711","attempt":1}
//! ```

use std::{
  fs::{File, OpenOptions},
  io::{ErrorKind, Read, Seek, SeekFrom, Write},
  path::{Path, PathBuf},
  sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use filebus_core::ChangeKind;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalState {
  Processing,
  Processed,
  Failed,
}

impl JournalState {
  pub fn as_str(&self) -> &'static str {
    match self {
      JournalState::Processing => "processing",
      JournalState::Processed => "processed",
      JournalState::Failed => "failed",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
  pub state: JournalState,
  pub timestamp: DateTime<Utc>,
  /// Modification time of the work file when the record was written
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_write: Option<DateTime<Utc>>,
  pub trigger: ChangeKind,
  pub instance_id: String,
  /// 1-based attempt number
  pub attempt: u32,
}

impl JournalRecord {
  pub fn new(
    state: JournalState,
    last_write: Option<DateTime<Utc>>,
    trigger: ChangeKind,
    instance_id: &str,
    attempt: u32,
  ) -> Self {
    Self {
      state,
      timestamp: Utc::now(),
      last_write,
      trigger,
      instance_id: instance_id.to_string(),
      attempt,
    }
  }
}

/// Parse journal content, ignoring blank lines and skipping torn or garbled ones
pub fn parse_records(path: &Path, content: &str) -> Vec<JournalRecord> {
  content
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .filter_map(|line| match serde_json::from_str::<JournalRecord>(line) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Skipping malformed journal line");
        None
      }
    })
    .collect()
}

/// Modification time of a file as a UTC timestamp, `None` when it is gone
pub fn last_write_time(path: &Path) -> Option<DateTime<Utc>> {
  std::fs::metadata(path)
    .and_then(|m| m.modified())
    .ok()
    .map(DateTime::<Utc>::from)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
  #[error("Journal is locked by another worker: {0}")]
  Contended(PathBuf),

  #[error("Journal I/O failed for {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to encode journal record: {0}")]
  Encode(#[from] serde_json::Error),
}

impl JournalError {
  fn io(path: &Path, source: std::io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

// ============================================================================
// In-process lock set
// ============================================================================

/// Journals held by this process.
///
/// OS advisory locks are not reliable between handles of one process on every
/// filesystem (NFS emulates them per process), so workers of one listener also
/// claim the path here before touching the OS lock.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
  held: Arc<DashSet<PathBuf>>,
}

impl LockSet {
  pub fn new() -> Self {
    Self::default()
  }

  fn claim(&self, path: &Path) -> bool {
    self.held.insert(path.to_path_buf())
  }

  fn release(&self, path: &Path) {
    self.held.remove(path);
  }

  pub fn is_held(&self, path: &Path) -> bool {
    self.held.contains(path)
  }
}

// ============================================================================
// Locked journal
// ============================================================================

/// An exclusively locked journal. The lock is released on drop.
#[derive(Debug)]
pub struct Journal {
  path: PathBuf,
  file: File,
  records: Vec<JournalRecord>,
  created: bool,
  locks: LockSet,
}

impl Journal {
  /// Open (or create) and exclusively lock the journal at `path`.
  ///
  /// Never blocks: any competing holder yields [`JournalError::Contended`].
  pub fn try_acquire(path: &Path, locks: &LockSet) -> Result<Self, JournalError> {
    if !locks.claim(path) {
      return Err(JournalError::Contended(path.to_path_buf()));
    }

    match Self::open_locked(path) {
      Ok((file, records, created)) => {
        trace!(path = %path.display(), created, "Journal acquired");
        Ok(Self {
          path: path.to_path_buf(),
          file,
          records,
          created,
          locks: locks.clone(),
        })
      }
      Err(e) => {
        locks.release(path);
        Err(e)
      }
    }
  }

  fn open_locked(path: &Path) -> Result<(File, Vec<JournalRecord>, bool), JournalError> {
    let (mut file, created) = match open_options(true).open(path) {
      Ok(file) => (file, true),
      Err(e) if e.kind() == ErrorKind::AlreadyExists => {
        (open_options(false).open(path).map_err(|e| JournalError::io(path, e))?, false)
      }
      Err(e) => return Err(JournalError::io(path, e)),
    };

    if FileExt::try_lock_exclusive(&file).is_err() {
      return Err(JournalError::Contended(path.to_path_buf()));
    }

    let mut content = String::new();
    file
      .read_to_string(&mut content)
      .map_err(|e| JournalError::io(path, e))?;

    Ok((file, parse_records(path, &content), created))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// True when this acquisition created the file
  pub fn created(&self) -> bool {
    self.created
  }

  pub fn records(&self) -> &[JournalRecord] {
    &self.records
  }

  pub fn last(&self) -> Option<&JournalRecord> {
    self.records.last()
  }

  /// Append a record and flush it to stable storage
  pub fn append(&mut self, record: JournalRecord) -> Result<(), JournalError> {
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');

    self
      .file
      .seek(SeekFrom::End(0))
      .map_err(|e| JournalError::io(&self.path, e))?;
    self
      .file
      .write_all(line.as_bytes())
      .map_err(|e| JournalError::io(&self.path, e))?;
    self.file.flush().map_err(|e| JournalError::io(&self.path, e))?;
    self.file.sync_data().map_err(|e| JournalError::io(&self.path, e))?;

    self.records.push(record);
    Ok(())
  }

  /// Release the lock and return the journal path
  pub fn release(self) -> PathBuf {
    self.path.clone()
  }

  /// Release the lock and delete the journal file
  pub fn discard(self) {
    let path = self.release();
    if let Err(e) = std::fs::remove_file(&path)
      && e.kind() != ErrorKind::NotFound
    {
      warn!(path = %path.display(), error = %e, "Failed to remove journal");
    }
  }
}

impl Drop for Journal {
  fn drop(&mut self) {
    let _ = FileExt::unlock(&self.file);
    self.locks.release(&self.path);
  }
}

fn open_options(create_new: bool) -> OpenOptions {
  let mut options = OpenOptions::new();
  options.read(true).write(true);
  if create_new {
    options.create_new(true);
  }
  #[cfg(windows)]
  {
    use std::os::windows::fs::OpenOptionsExt;
    options.share_mode(0);
  }
  options
}

// ============================================================================
// Shared reads
// ============================================================================

/// Read the last record without taking ownership of the item.
///
/// Returns `Ok(None)` for a missing or empty journal and
/// [`JournalError::Contended`] while a worker holds it.
pub fn read_last(path: &Path) -> Result<Option<JournalRecord>, JournalError> {
  let mut file = match File::open(path) {
    Ok(file) => file,
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(JournalError::io(path, e)),
  };

  if FileExt::try_lock_shared(&file).is_err() {
    return Err(JournalError::Contended(path.to_path_buf()));
  }

  let mut content = String::new();
  let read = file.read_to_string(&mut content);
  let _ = FileExt::unlock(&file);
  read.map_err(|e| JournalError::io(path, e))?;

  Ok(parse_records(path, &content).pop())
}

/// Read every record, ignoring locks. Used for reporting only.
pub fn read_all(path: &Path) -> Result<Vec<JournalRecord>, JournalError> {
  match std::fs::read_to_string(path) {
    Ok(content) => Ok(parse_records(path, &content)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
    Err(e) => Err(JournalError::io(path, e)),
  }
}
