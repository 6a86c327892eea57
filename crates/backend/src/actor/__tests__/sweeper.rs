#[cfg(test)]
mod tests {
  use std::{path::PathBuf, sync::Arc, time::Duration};

  use filebus_core::ChangeKind;
  use pretty_assertions::assert_eq;
  use tokio::sync::Notify;
  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      __tests__::helpers::{BusTestContext, PING, ScriptedHandler, dispatcher_for, wait_for},
      handle::work_queue,
      message::{Observers, Outcome, ProcessorEvent, WorkItem},
      sweeper::{Rescan, Sweeper},
    },
    journal::{Journal, JournalRecord, JournalState, LockSet},
  };

  fn sweeper(ctx: &BusTestContext, observers: Observers, rescan: Option<Rescan>, poke: Arc<Notify>) -> Sweeper {
    Sweeper::new(
      ctx.layout.clone(),
      ctx.config.sweeper.clone(),
      LockSet::new(),
      observers,
      rescan,
      poke,
    )
  }

  /// Write and process one envelope with the given number of scripted failures
  async fn processed_item(ctx: &BusTestContext, failures: usize) -> (PathBuf, Outcome) {
    let processor = ctx.processor(
      dispatcher_for(Arc::new(ScriptedHandler::new(PING, failures))),
      LockSet::new(),
      Observers::new(),
    );
    let (_, path) = ctx.write_envelope(PING, "{}");
    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;
    (path, outcome)
  }

  #[tokio::test]
  async fn test_sweep_removes_processed_item_and_companions() {
    let ctx = BusTestContext::new();
    let (path, outcome) = processed_item(&ctx, 0).await;
    assert!(matches!(outcome, Outcome::Processed { .. }));

    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let companion = ctx.layout.queue.join(format!("{name}.meta"));
    std::fs::write(&companion, "extra").unwrap();

    let observers = Observers::new();
    let mut events = observers.subscribe();
    let swept = sweeper(&ctx, observers, None, Arc::new(Notify::new())).sweep_once();

    assert_eq!(swept, 1);
    assert!(!path.exists());
    assert!(!companion.exists());
    assert!(!ctx.layout.journal_path(&path).exists());
    assert!(ctx.file_names(&ctx.layout.queue).is_empty());
    // Terminal copy is kept
    assert_eq!(ctx.file_names(&ctx.layout.completed), vec![name]);
    assert_eq!(events.try_recv().unwrap(), ProcessorEvent::Swept { path });
  }

  #[tokio::test]
  async fn test_sweep_leaves_unfinished_items_alone() {
    let ctx = BusTestContext::new();
    let (exhausted, outcome) = processed_item(&ctx, usize::MAX).await;
    assert_eq!(outcome, Outcome::Exhausted { attempts: 3 });
    let (_, fresh) = ctx.write_envelope(PING, "{}");

    let swept = sweeper(&ctx, Observers::new(), None, Arc::new(Notify::new())).sweep_once();

    assert_eq!(swept, 0);
    assert!(exhausted.exists());
    assert!(ctx.layout.journal_path(&exhausted).exists());
    assert!(fresh.exists());
  }

  #[tokio::test]
  async fn test_sweep_leaves_interrupted_item_alone() {
    let ctx = BusTestContext::new();
    let (_, path) = ctx.write_envelope(PING, "{}");
    {
      let mut journal = Journal::try_acquire(&ctx.layout.journal_path(&path), &LockSet::new()).unwrap();
      for state in [JournalState::Processing, JournalState::Processed, JournalState::Processing] {
        journal
          .append(JournalRecord::new(state, None, ChangeKind::Changed, "crashed", 1))
          .unwrap();
      }
    }

    let swept = sweeper(&ctx, Observers::new(), None, Arc::new(Notify::new())).sweep_once();

    assert_eq!(swept, 0);
    assert!(path.exists());
    assert_eq!(ctx.journal_records(&path).len(), 3);
  }

  #[tokio::test]
  async fn test_sweep_skips_journal_held_elsewhere() {
    let ctx = BusTestContext::new();
    let (path, _) = processed_item(&ctx, 0).await;

    let held = Journal::try_acquire(&ctx.layout.journal_path(&path), &LockSet::new()).unwrap();
    let sweeper = sweeper(&ctx, Observers::new(), None, Arc::new(Notify::new()));
    assert_eq!(sweeper.sweep_once(), 0);
    assert!(path.exists());

    drop(held);
    assert_eq!(sweeper.sweep_once(), 1);
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn test_sweep_removes_orphaned_empty_journal() {
    let ctx = BusTestContext::new();
    let orphan = ctx.layout.journal_path(&ctx.layout.queue.join("vanished.json"));
    std::fs::write(&orphan, "").unwrap();

    let swept = sweeper(&ctx, Observers::new(), None, Arc::new(Notify::new())).sweep_once();

    // Not counted as a swept work item, but cleaned up
    assert_eq!(swept, 0);
    assert!(!orphan.exists());
  }

  #[tokio::test]
  async fn test_pass_reposts_pending_items() {
    let ctx = BusTestContext::new();
    let (_, path) = ctx.write_envelope(PING, "{}");
    let observers = Observers::new();
    let (queue, mut receiver) = work_queue(0, observers.clone());

    let rescan = Rescan {
      queue,
      max_attempts: ctx.config.processor.max_attempts,
    };
    sweeper(&ctx, observers, Some(rescan), Arc::new(Notify::new()))
      .pass()
      .await;

    let item = receiver.recv().await.unwrap();
    assert_eq!(item, WorkItem::new(path, ChangeKind::Created));
  }

  #[tokio::test]
  async fn test_poke_triggers_sweep_before_timer() {
    let ctx = BusTestContext::with_config(|config| {
      config.sweeper.min_interval_ms = 60_000;
      config.sweeper.max_interval_ms = 60_000;
    });
    let (path, _) = processed_item(&ctx, 0).await;

    let poke = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sweeper(&ctx, Observers::new(), None, poke.clone()).run(cancel.clone()));

    poke.notify_one();
    let gone = wait_for(Duration::from_secs(2), || {
      let path = path.clone();
      async move { !path.exists() }
    })
    .await;
    assert!(gone, "poked sweep did not remove the processed item");

    cancel.cancel();
    task.await.unwrap();
  }
}
