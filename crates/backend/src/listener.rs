//! QueueListener - wires the watcher, worker pool and sweeper for one bus root
//!
//! Lifecycle of [`QueueListener::start`]:
//! 1. Check the root folder exists and create `queue/ completed/ error/`
//! 2. Start watching the queue folder (events are buffered from here on)
//! 3. Scan the backlog left by previous runs or other instances
//! 4. Spawn the watcher, the worker pool and the sweeper
//!
//! [`ListenerHandle::stop`] cancels everything and waits for the tasks to drain.

use std::{path::PathBuf, sync::Arc, time::Duration};

use filebus_core::{Config, ConfigError};
use tokio::{
  sync::{Notify, broadcast},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
  actor::{
    Observers, ProcessorEvent, ProcessorSettings, Rescan, Sweeper, WatcherConfig, WatcherError, WatcherTask,
    WorkProcessor, WorkerPool, backlog, work_queue,
  },
  dirs,
  dispatch::Dispatcher,
  journal::LockSet,
  layout::QueueLayout,
};

// ============================================================================
// Errors
// ============================================================================

/// Startup failures; all of them are fatal for the listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("Invalid file filter: {0}")]
  Filter(#[from] glob::PatternError),

  #[error("Root folder does not exist: {0}")]
  MissingRoot(PathBuf),

  #[error("Failed to create queue folders under {path}: {source}")]
  CreateFolder {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Watcher(#[from] WatcherError),
}

// ============================================================================
// QueueListener
// ============================================================================

pub struct QueueListener {
  config: Config,
  layout: Arc<QueueLayout>,
  dispatcher: Arc<dyn Dispatcher>,
  observers: Observers,
}

impl QueueListener {
  /// Validate the configuration and prepare a listener. Nothing touches the
  /// filesystem until [`QueueListener::start`].
  pub fn new(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, ListenerError> {
    config.validate()?;
    let layout = QueueLayout::from_config(&config.queue)?;

    Ok(Self {
      config,
      layout: Arc::new(layout),
      dispatcher,
      observers: Observers::new(),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn layout(&self) -> &QueueLayout {
    &self.layout
  }

  /// Subscribe before `start` to see events from the backlog scan
  pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
    self.observers.subscribe()
  }

  /// Start all tasks. They run until `cancel` (or [`ListenerHandle::stop`]) fires.
  pub async fn start(self, cancel: CancellationToken) -> Result<ListenerHandle, ListenerError> {
    let root = &self.layout.root;
    if !root.is_dir() {
      return Err(ListenerError::MissingRoot(root.clone()));
    }
    self.layout.ensure().map_err(|source| ListenerError::CreateFolder {
      path: root.clone(),
      source,
    })?;

    let processor_config = &self.config.processor;
    let instance_id = dirs::instance_id(&processor_config.instance_id_env);
    info!(
      root = %root.display(),
      instance_id = %instance_id,
      workers = processor_config.max_concurrency,
      max_attempts = processor_config.max_attempts,
      "Starting queue listener"
    );

    let locks = LockSet::new();
    let (queue, receiver) = work_queue(processor_config.max_queue_size, self.observers.clone());

    // Watch before scanning so files written during the scan are not missed
    let watcher = WatcherTask::new(
      WatcherConfig::from_config(&self.config, self.layout.clone()),
      queue.clone(),
      cancel.child_token(),
    )?;

    let processor = Arc::new(WorkProcessor::new(
      self.layout.clone(),
      self.dispatcher.clone(),
      locks.clone(),
      self.observers.clone(),
      ProcessorSettings::from_config(&self.config, &instance_id),
    ));
    let sweep = Arc::new(Notify::new());

    let mut tasks = WorkerPool::new(processor, receiver, sweep.clone())
      .spawn(processor_config.max_concurrency, cancel.child_token());

    backlog::scan(&self.layout, processor_config.max_attempts, &queue).await;

    tasks.push(tokio::spawn(watcher.run()));

    let sweeper_config = self.config.sweeper.clone();
    if sweeper_config.auto_delete || sweeper_config.rescan_pending {
      let rescan = sweeper_config.rescan_pending.then(|| Rescan {
        queue: queue.clone(),
        max_attempts: processor_config.max_attempts,
      });
      let sweeper = Sweeper::new(
        self.layout.clone(),
        sweeper_config,
        locks,
        self.observers.clone(),
        rescan,
        sweep,
      );
      tasks.push(tokio::spawn(sweeper.run(cancel.child_token())));
    }

    info!(tasks = tasks.len(), "Queue listener started");

    Ok(ListenerHandle {
      cancel,
      tasks,
      observers: self.observers,
      shutdown_timeout: processor_config.shutdown_timeout(),
    })
  }
}

// ============================================================================
// ListenerHandle
// ============================================================================

/// Owner of a running listener's tasks
pub struct ListenerHandle {
  cancel: CancellationToken,
  tasks: Vec<JoinHandle<()>>,
  observers: Observers,
  shutdown_timeout: Duration,
}

impl ListenerHandle {
  pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
    self.observers.subscribe()
  }

  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Cancel and wait for the tasks, abandoning any still running after the
  /// shutdown timeout
  pub async fn stop(self) {
    info!("Stopping queue listener");
    self.cancel.cancel();
    self.drain().await;
  }

  /// Wait until the cancellation token fires, then drain like [`ListenerHandle::stop`]
  pub async fn wait(self) {
    self.cancel.cancelled().await;
    self.drain().await;
  }

  async fn drain(self) {
    let count = self.tasks.len();
    let aborts: Vec<_> = self.tasks.iter().map(|task| task.abort_handle()).collect();

    match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(self.tasks)).await {
      Ok(results) => {
        for result in results {
          if let Err(e) = result
            && e.is_panic()
          {
            warn!(error = %e, "Listener task panicked");
          }
        }
        info!(tasks = count, "Queue listener stopped");
      }
      Err(_) => {
        let stragglers = aborts.iter().filter(|abort| !abort.is_finished()).count();
        warn!(
          stragglers,
          timeout_secs = self.shutdown_timeout.as_secs(),
          "Shutdown timed out, abandoning tasks"
        );
        for abort in aborts {
          abort.abort();
        }
      }
    }
  }
}
