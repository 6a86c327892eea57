//! Fixed-size pool of workers draining the work queue.

use std::sync::Arc;

use tokio::{
  sync::{Mutex, Notify},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{handle::WorkReceiver, processor::WorkProcessor};

pub struct WorkerPool {
  processor: Arc<WorkProcessor>,
  receiver: Arc<Mutex<WorkReceiver>>,
  /// Poked after every finished item so the sweeper can clean up promptly
  sweep: Arc<Notify>,
}

impl WorkerPool {
  pub fn new(processor: Arc<WorkProcessor>, receiver: WorkReceiver, sweep: Arc<Notify>) -> Self {
    Self {
      processor,
      receiver: Arc::new(Mutex::new(receiver)),
      sweep,
    }
  }

  /// Spawn `workers` tasks sharing the queue
  pub fn spawn(self, workers: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    info!(workers, "Starting worker pool");
    (0..workers.max(1))
      .map(|worker| {
        let processor = self.processor.clone();
        let receiver = self.receiver.clone();
        let sweep = self.sweep.clone();
        let cancel = cancel.clone();
        tokio::spawn(run_worker(worker, processor, receiver, sweep, cancel))
      })
      .collect()
  }
}

async fn run_worker(
  worker: usize,
  processor: Arc<WorkProcessor>,
  receiver: Arc<Mutex<WorkReceiver>>,
  sweep: Arc<Notify>,
  cancel: CancellationToken,
) {
  debug!(worker, "Worker started");

  loop {
    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = async { receiver.lock().await.recv().await } => item,
    };

    let Some(item) = next else {
      break;
    };

    let outcome = processor.process(item, &cancel).await;
    debug!(worker, ?outcome, "Work item finished");
    sweep.notify_one();
  }

  debug!(worker, "Worker stopped");
}
