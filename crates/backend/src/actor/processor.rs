//! WorkProcessor - runs one work item through its journal state machine
//!
//! ```text
//! Unseen ──► Processing ──► Processed
//!               │  ▲
//!               ▼  │ (backoff, attempt < max)
//!             Failed ──► (attempt == max) error copy, terminal
//! ```
//!
//! The journal lock is held for the whole run, including retry backoff, so no
//! other worker or instance can touch the item meanwhile.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use filebus_core::{ChangeKind, Config, EnvelopeError, MessageEnvelope, peek_envelope_id};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::message::{Observers, Outcome, ProcessorEvent, SkipReason, WorkItem};
use crate::{
  dispatch::{AttemptContext, DispatchError, Dispatcher},
  journal::{self, Journal, JournalRecord, JournalState, LockSet},
  layout::QueueLayout,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
  pub max_attempts: u32,
  pub retry_backoff: Duration,
  pub scan_delay: Duration,
  pub keep_completed: bool,
  pub instance_id: Arc<str>,
}

impl ProcessorSettings {
  pub fn from_config(config: &Config, instance_id: &str) -> Self {
    Self {
      max_attempts: config.processor.max_attempts,
      retry_backoff: config.processor.retry_backoff(),
      scan_delay: config.processor.scan_delay(),
      keep_completed: config.queue.keep_completed,
      instance_id: Arc::from(instance_id),
    }
  }
}

/// Why a single attempt failed
#[derive(Debug, thiserror::Error)]
enum AttemptError {
  #[error("Failed to read work file: {0}")]
  Read(#[source] std::io::Error),

  #[error(transparent)]
  Envelope(#[from] EnvelopeError),

  #[error(transparent)]
  Dispatch(#[from] DispatchError),
}

// ============================================================================
// WorkProcessor
// ============================================================================

const LOCAL_RELEASE_POLL: Duration = Duration::from_millis(25);

pub struct WorkProcessor {
  layout: Arc<QueueLayout>,
  dispatcher: Arc<dyn Dispatcher>,
  locks: LockSet,
  observers: Observers,
  settings: ProcessorSettings,
}

impl WorkProcessor {
  pub fn new(
    layout: Arc<QueueLayout>,
    dispatcher: Arc<dyn Dispatcher>,
    locks: LockSet,
    observers: Observers,
    settings: ProcessorSettings,
  ) -> Self {
    Self {
      layout,
      dispatcher,
      locks,
      observers,
      settings,
    }
  }

  pub fn settings(&self) -> &ProcessorSettings {
    &self.settings
  }

  /// Process one work item to a terminal outcome for this run
  pub async fn process(&self, item: WorkItem, cancel: &CancellationToken) -> Outcome {
    let path = item.path.as_path();

    if item.trigger == ChangeKind::Deleted {
      debug!(path = %path.display(), "Work file deleted");
      return self.skip(path, SkipReason::Deleted);
    }

    let delay = self.settings.scan_delay;
    if !delay.is_zero() {
      tokio::select! {
          biased;
          _ = cancel.cancelled() => return self.skip(path, SkipReason::Cancelled),
          _ = tokio::time::sleep(delay) => {}
      }
    }

    if !path.exists() {
      return self.skip(path, SkipReason::Missing);
    }

    let journal_path = self.layout.journal_path(path);
    let mut journal = loop {
      match Journal::try_acquire(&journal_path, &self.locks) {
        Ok(journal) => break journal,
        // A change queued behind a running attempt of this listener waits for it
        Err(_) if item.trigger == ChangeKind::Changed && self.locks.is_held(&journal_path) => {
          tokio::select! {
              biased;
              _ = cancel.cancelled() => return self.skip(path, SkipReason::Cancelled),
              _ = tokio::time::sleep(LOCAL_RELEASE_POLL) => {}
          }
        }
        Err(e) => {
          debug!(path = %path.display(), error = %e, "Work item contended");
          self.observers.emit(ProcessorEvent::Contended {
            path: path.to_path_buf(),
          });
          return Outcome::Contended;
        }
      }
    };

    // Swept or moved away between the check above and the lock
    if !path.exists() {
      if journal.created() {
        journal.discard();
      }
      return self.skip(path, SkipReason::Missing);
    }

    let mut attempt = 0;
    let mut retrying = false;
    let mut interrupted = false;
    if let Some(last) = journal.last() {
      match last.state {
        JournalState::Processed => {
          if item.trigger != ChangeKind::Changed {
            return self.skip(path, SkipReason::AlreadyProcessed);
          }
          if last.last_write == journal::last_write_time(path) {
            return self.skip(path, SkipReason::Unchanged);
          }
          debug!(path = %path.display(), "Content changed since last success, starting over");
        }
        JournalState::Failed => {
          attempt = last.attempt;
          retrying = true;
        }
        // Interrupted mid-attempt; that attempt counts
        JournalState::Processing => {
          attempt = last.attempt;
          interrupted = true;
        }
      }
    }

    let max_attempts = self.settings.max_attempts;
    if attempt >= max_attempts {
      // The final attempt never recorded its result
      if interrupted {
        return self
          .exhaust(&mut journal, path, item.trigger, attempt, "final attempt was interrupted")
          .await;
      }
      return self.skip(path, SkipReason::Exhausted);
    }

    let mut last_error = String::new();
    while attempt < max_attempts {
      if cancel.is_cancelled() {
        return self.skip(path, SkipReason::Cancelled);
      }

      if retrying {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.skip(path, SkipReason::Cancelled),
            _ = tokio::time::sleep(self.settings.retry_backoff) => {}
        }
      }

      attempt += 1;
      // The version being delivered; a later write must not be marked processed
      let seen = journal::last_write_time(path);
      if let Err(e) = journal.append(self.record(JournalState::Processing, seen, item.trigger, attempt)) {
        warn!(path = %path.display(), error = %e, "Failed to record attempt");
        return self.skip(path, SkipReason::JournalUnavailable);
      }
      self.observers.emit(ProcessorEvent::AttemptStarted {
        path: path.to_path_buf(),
        attempt,
      });

      match self.attempt(path, attempt, cancel).await {
        Ok((id, bytes)) => {
          if let Err(e) = journal.append(self.record(JournalState::Processed, seen, item.trigger, attempt)) {
            warn!(path = %path.display(), error = %e, "Failed to record completion");
          }
          if self.settings.keep_completed {
            self.write_copy(&self.layout.completed_file(&format!("{}.json", id)), &bytes).await;
          }

          info!(envelope_id = %id, path = %path.display(), attempt, "Work item processed");
          self.observers.emit(ProcessorEvent::Processed {
            path: path.to_path_buf(),
            id,
            attempt,
          });
          return Outcome::Processed { id, attempt };
        }
        Err(e) => {
          last_error = e.to_string();
          warn!(
            path = %path.display(),
            attempt,
            max_attempts,
            error = %last_error,
            "Attempt failed"
          );
          self.observers.emit(ProcessorEvent::AttemptFailed {
            path: path.to_path_buf(),
            attempt,
            error: last_error.clone(),
          });
          if attempt >= max_attempts {
            break;
          }
          if let Err(e) = journal.append(self.record(JournalState::Failed, seen, item.trigger, attempt)) {
            warn!(path = %path.display(), error = %e, "Failed to record failure");
          }
          retrying = true;
        }
      }
    }

    self.exhaust(&mut journal, path, item.trigger, attempt, &last_error).await
  }

  /// Terminal failure: error copy first, then the final `Failed` record.
  ///
  /// A crash between the two leaves the last record at `Processing`, which
  /// brings the item back here on the next scan.
  async fn exhaust(
    &self,
    journal: &mut Journal,
    path: &Path,
    trigger: ChangeKind,
    attempts: u32,
    last_error: &str,
  ) -> Outcome {
    let copy = self.copy_to_error(path).await;
    if let Err(e) = journal.append(self.record(JournalState::Failed, journal::last_write_time(path), trigger, attempts)) {
      warn!(path = %path.display(), error = %e, "Failed to record failure");
    }
    error!(
      path = %path.display(),
      attempts,
      error = %last_error,
      error_copy = ?copy,
      "Work item failed permanently"
    );
    self.observers.emit(ProcessorEvent::Exhausted {
      path: path.to_path_buf(),
      attempts,
    });
    Outcome::Exhausted { attempts }
  }

  /// One delivery: read, decode, dispatch
  async fn attempt(
    &self,
    path: &Path,
    attempt: u32,
    cancel: &CancellationToken,
  ) -> Result<(Uuid, Vec<u8>), AttemptError> {
    let bytes = tokio::fs::read(path).await.map_err(AttemptError::Read)?;
    let mut envelope = MessageEnvelope::from_slice(&bytes)?;
    envelope.attempts_count = u64::from(attempt - 1);

    let span = info_span!(
      "dispatch",
      envelope_id = %envelope.id,
      message_type = %envelope.message_type,
      attempt
    );
    let ctx = AttemptContext::new(attempt, self.settings.instance_id.clone(), path.to_path_buf(), cancel.clone())
      .with_span(span.clone());

    let id = envelope.id;
    let handled = self
      .dispatcher
      .dispatch(Arc::new(envelope), &ctx)
      .instrument(span)
      .await?;
    debug!(envelope_id = %id, handled, "Dispatch complete");

    Ok((id, bytes))
  }

  fn record(
    &self,
    state: JournalState,
    last_write: Option<DateTime<Utc>>,
    trigger: ChangeKind,
    attempt: u32,
  ) -> JournalRecord {
    JournalRecord::new(
      state,
      last_write,
      trigger,
      &self.settings.instance_id,
      attempt,
    )
  }

  fn skip(&self, path: &Path, reason: SkipReason) -> Outcome {
    debug!(path = %path.display(), ?reason, "Work item skipped");
    self.observers.emit(ProcessorEvent::Skipped {
      path: path.to_path_buf(),
      reason,
    });
    Outcome::Skipped(reason)
  }

  /// Copy the raw work file to `<error>/<id>.json`, falling back to its own name
  async fn copy_to_error(&self, path: &Path) -> Option<PathBuf> {
    let bytes = match tokio::fs::read(path).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to read work file for error copy");
        return None;
      }
    };

    let name = match peek_envelope_id(&bytes) {
      Some(id) => format!("{}.json", id),
      None => path.file_name()?.to_string_lossy().into_owned(),
    };
    let target = self.layout.error_file(&name);
    self.write_copy(&target, &bytes).await.then_some(target)
  }

  async fn write_copy(&self, target: &Path, bytes: &[u8]) -> bool {
    match tokio::fs::write(target, bytes).await {
      Ok(()) => true,
      Err(e) => {
        warn!(path = %target.display(), error = %e, "Failed to write copy");
        false
      }
    }
  }
}
