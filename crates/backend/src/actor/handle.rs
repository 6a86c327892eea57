//! Work queue handles
//!
//! [`WorkQueue`] is cheap to clone and is shared by the watcher, the backlog
//! scan and the sweeper. The single [`WorkReceiver`] is shared by the worker
//! pool. An item already waiting with the same path and trigger is not queued
//! twice; a different trigger for that path is queued behind it.

use std::{path::PathBuf, sync::Arc};

use dashmap::DashSet;
use filebus_core::ChangeKind;
use tokio::sync::mpsc;
use tracing::trace;

use super::message::{Observers, ProcessorEvent, WorkItem};

// ============================================================================
// Queue
// ============================================================================

type PendingKey = (PathBuf, ChangeKind);

#[derive(Clone, Debug)]
enum QueueSender {
  Bounded(mpsc::Sender<WorkItem>),
  Unbounded(mpsc::UnboundedSender<WorkItem>),
}

#[derive(Debug)]
enum QueueReceiver {
  Bounded(mpsc::Receiver<WorkItem>),
  Unbounded(mpsc::UnboundedReceiver<WorkItem>),
}

/// Create a work queue; `capacity == 0` means unbounded
pub fn work_queue(capacity: usize, observers: Observers) -> (WorkQueue, WorkReceiver) {
  let pending = Arc::new(DashSet::new());

  let (tx, rx) = if capacity == 0 {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
  } else {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
  };

  (
    WorkQueue {
      tx,
      pending: pending.clone(),
      observers,
    },
    WorkReceiver { rx, pending },
  )
}

/// Producer side of the work queue
#[derive(Clone, Debug)]
pub struct WorkQueue {
  tx: QueueSender,
  pending: Arc<DashSet<PendingKey>>,
  observers: Observers,
}

impl WorkQueue {
  /// Queue an item. Waits for capacity on a bounded queue.
  ///
  /// Returns `Ok(false)` when the same path is already waiting with the same trigger.
  pub async fn post(&self, item: WorkItem) -> Result<bool, SendError> {
    let key = (item.path.clone(), item.trigger);
    if !self.pending.insert(key.clone()) {
      trace!(path = %item.path.display(), trigger = item.trigger.as_str(), "Already queued, coalescing");
      return Ok(false);
    }

    let event = ProcessorEvent::Enqueued {
      path: item.path.clone(),
      trigger: item.trigger,
    };
    let sent = match &self.tx {
      QueueSender::Bounded(tx) => tx.send(item).await.map_err(|_| SendError::ActorGone),
      QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| SendError::ActorGone),
    };

    match sent {
      Ok(()) => {
        self.observers.emit(event);
        Ok(true)
      }
      Err(e) => {
        self.pending.remove(&key);
        Err(e)
      }
    }
  }

  /// Number of distinct items waiting to be picked up
  pub fn pending(&self) -> usize {
    self.pending.len()
  }
}

/// Consumer side of the work queue
#[derive(Debug)]
pub struct WorkReceiver {
  rx: QueueReceiver,
  pending: Arc<DashSet<PendingKey>>,
}

impl WorkReceiver {
  /// Next item, or `None` once every producer is gone
  pub async fn recv(&mut self) -> Option<WorkItem> {
    let item = match &mut self.rx {
      QueueReceiver::Bounded(rx) => rx.recv().await,
      QueueReceiver::Unbounded(rx) => rx.recv().await,
    }?;
    self.pending.remove(&(item.path.clone(), item.trigger));
    Some(item)
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to the worker pool
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Worker pool has shut down")]
  ActorGone,
}
