#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use chrono::Utc;
  use filebus_core::ChangeKind;
  use filetime::FileTime;
  use pretty_assertions::assert_eq;
  use tokio_util::sync::CancellationToken;

  use crate::{
    actor::{
      __tests__::helpers::{BusTestContext, PING, ScriptedHandler, dispatcher_for, wait_for},
      message::{Observers, Outcome, ProcessorEvent, SkipReason, WorkItem},
    },
    journal::{Journal, JournalRecord, JournalState, LockSet},
  };

  fn states(records: &[JournalRecord]) -> Vec<(JournalState, u32)> {
    records.iter().map(|r| (r.state, r.attempt)).collect()
  }

  #[tokio::test]
  async fn test_successful_attempt_is_journaled_and_copied() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (envelope, path) = ctx.write_envelope(PING, r#"{"n":1}"#);

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(
      outcome,
      Outcome::Processed {
        id: envelope.id,
        attempt: 1
      }
    );
    assert_eq!(handler.handled(), vec![envelope.id]);

    let records = ctx.journal_records(&path);
    assert_eq!(
      states(&records),
      vec![(JournalState::Processing, 1), (JournalState::Processed, 1)]
    );
    assert!(records.iter().all(|r| r.instance_id == "test-instance"));
    assert!(records.iter().all(|r| r.trigger == ChangeKind::Created));

    // Work file stays until the sweeper removes it
    assert!(path.exists());
    assert_eq!(ctx.file_names(&ctx.layout.completed), vec![envelope.file_name()]);
    assert!(ctx.file_names(&ctx.layout.error).is_empty());
  }

  #[tokio::test]
  async fn test_processed_item_is_not_delivered_again() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();

    processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel).await;
    let again = processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel).await;
    let renamed = processor.process(WorkItem::new(&path, ChangeKind::Renamed), &cancel).await;

    assert_eq!(again, Outcome::Skipped(SkipReason::AlreadyProcessed));
    assert_eq!(renamed, Outcome::Skipped(SkipReason::AlreadyProcessed));
    assert_eq!(handler.calls(), 1);
    assert_eq!(ctx.journal_records(&path).len(), 2);
  }

  #[tokio::test]
  async fn test_changed_trigger_reprocesses_only_new_content() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();

    processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel).await;

    let unchanged = processor.process(WorkItem::new(&path, ChangeKind::Changed), &cancel).await;
    assert_eq!(unchanged, Outcome::Skipped(SkipReason::Unchanged));
    assert_eq!(handler.calls(), 1);

    let later = FileTime::from_unix_time(Utc::now().timestamp() + 60, 0);
    filetime::set_file_mtime(&path, later).unwrap();

    let changed = processor.process(WorkItem::new(&path, ChangeKind::Changed), &cancel).await;
    assert!(matches!(changed, Outcome::Processed { attempt: 1, .. }), "{changed:?}");
    assert_eq!(handler.calls(), 2);

    let records = ctx.journal_records(&path);
    assert_eq!(records.len(), 4);
    assert_eq!(records[3].trigger, ChangeKind::Changed);
    assert_ne!(records[1].last_write, records[3].last_write);
  }

  #[tokio::test]
  async fn test_change_during_attempt_is_delivered_after_it() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0).with_delay(Duration::from_millis(200)));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
      processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel),
      async {
        // Rewrite the file while the first delivery is in the handler
        let started = wait_for(Duration::from_secs(5), || {
          let handler = handler.clone();
          async move { handler.calls() == 1 }
        })
        .await;
        assert!(started, "first delivery never reached the handler");
        let later = FileTime::from_unix_time(Utc::now().timestamp() + 60, 0);
        filetime::set_file_mtime(&path, later).unwrap();
        processor.process(WorkItem::new(&path, ChangeKind::Changed), &cancel).await
      },
    );

    assert!(matches!(first, Outcome::Processed { attempt: 1, .. }), "{first:?}");
    assert!(matches!(second, Outcome::Processed { attempt: 1, .. }), "{second:?}");
    assert_eq!(handler.calls(), 2);
    assert_eq!(handler.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_retries_are_bounded_and_end_in_error_folder() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::always_failing(PING));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (envelope, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();

    let outcome = processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel).await;

    assert_eq!(outcome, Outcome::Exhausted { attempts: 3 });
    assert_eq!(handler.calls(), 3);
    assert_eq!(
      states(&ctx.journal_records(&path)),
      vec![
        (JournalState::Processing, 1),
        (JournalState::Failed, 1),
        (JournalState::Processing, 2),
        (JournalState::Failed, 2),
        (JournalState::Processing, 3),
        (JournalState::Failed, 3),
      ]
    );
    assert_eq!(ctx.file_names(&ctx.layout.error), vec![envelope.file_name()]);
    assert!(ctx.file_names(&ctx.layout.completed).is_empty());

    // A later trigger finds nothing left to try
    let again = processor.process(WorkItem::new(&path, ChangeKind::Renamed), &cancel).await;
    assert_eq!(again, Outcome::Skipped(SkipReason::Exhausted));
    assert_eq!(handler.calls(), 3);
    assert_eq!(ctx.journal_records(&path).len(), 6);
  }

  #[tokio::test]
  async fn test_fails_twice_then_succeeds() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 2));
    let observers = Observers::new();
    let mut events = observers.subscribe();
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), observers);
    let (envelope, path) = ctx.write_envelope(PING, "{}");

    let started = std::time::Instant::now();
    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(
      outcome,
      Outcome::Processed {
        id: envelope.id,
        attempt: 3
      }
    );
    // Two backoffs of 20ms each
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(*handler.attempts_seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(
      states(&ctx.journal_records(&path)),
      vec![
        (JournalState::Processing, 1),
        (JournalState::Failed, 1),
        (JournalState::Processing, 2),
        (JournalState::Failed, 2),
        (JournalState::Processing, 3),
        (JournalState::Processed, 3),
      ]
    );
    assert!(ctx.file_names(&ctx.layout.error).is_empty());
    assert_eq!(ctx.file_names(&ctx.layout.completed), vec![envelope.file_name()]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    let failed = seen
      .iter()
      .filter(|e| matches!(e, ProcessorEvent::AttemptFailed { .. }))
      .count();
    assert_eq!(failed, 2);
    assert!(matches!(seen.last(), Some(ProcessorEvent::Processed { attempt: 3, .. })));
  }

  #[tokio::test]
  async fn test_unroutable_message_ends_in_error_folder() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new("tests.Other", 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (envelope, path) = ctx.write_envelope(PING, "{}");

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(outcome, Outcome::Exhausted { attempts: 3 });
    assert_eq!(handler.calls(), 0);
    assert_eq!(ctx.file_names(&ctx.layout.error), vec![envelope.file_name()]);
  }

  #[tokio::test]
  async fn test_garbled_work_file_keeps_its_name_in_error_folder() {
    let ctx = BusTestContext::new();
    let processor = ctx.processor(
      dispatcher_for(Arc::new(ScriptedHandler::new(PING, 0))),
      LockSet::new(),
      Observers::new(),
    );
    let path = ctx.layout.queue.join("broken.json");
    std::fs::write(&path, "not json").unwrap();

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(outcome, Outcome::Exhausted { attempts: 3 });
    assert_eq!(ctx.file_names(&ctx.layout.error), vec!["broken.json".to_string()]);
  }

  #[tokio::test]
  async fn test_missing_work_file_leaves_no_journal() {
    let ctx = BusTestContext::new();
    let processor = ctx.processor(
      dispatcher_for(Arc::new(ScriptedHandler::new(PING, 0))),
      LockSet::new(),
      Observers::new(),
    );
    let path = ctx.layout.queue.join("gone.json");

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(outcome, Outcome::Skipped(SkipReason::Missing));
    assert!(!ctx.layout.journal_path(&path).exists());
  }

  #[tokio::test]
  async fn test_deleted_trigger_is_never_dispatched() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Deleted), &CancellationToken::new())
      .await;

    assert_eq!(outcome, Outcome::Skipped(SkipReason::Deleted));
    assert_eq!(handler.calls(), 0);
    assert!(!ctx.layout.journal_path(&path).exists());
  }

  #[tokio::test]
  async fn test_locked_journal_is_contended_and_untouched() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let observers = Observers::new();
    let mut events = observers.subscribe();
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), observers);
    let (_, path) = ctx.write_envelope(PING, "{}");

    // Another instance holds the journal
    let held = Journal::try_acquire(&ctx.layout.journal_path(&path), &LockSet::new()).unwrap();

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert_eq!(outcome, Outcome::Contended);
    assert_eq!(handler.calls(), 0);
    assert_eq!(events.try_recv().unwrap(), ProcessorEvent::Contended { path: path.clone() });
    drop(held);
    assert!(ctx.journal_records(&path).is_empty());
  }

  #[tokio::test]
  async fn test_at_most_one_active_attempt_across_instances() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0).with_delay(Duration::from_millis(200)));
    let dispatcher = dispatcher_for(handler.clone());

    // Separate lock sets behave like separate processes sharing the folder
    let first = ctx.processor(dispatcher.clone(), LockSet::new(), Observers::new());
    let second = ctx.processor(dispatcher, LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
      first.process(WorkItem::new(&path, ChangeKind::Created), &cancel),
      second.process(WorkItem::new(&path, ChangeKind::Renamed), &cancel),
    );

    let processed = [&a, &b]
      .iter()
      .filter(|o| matches!(o, Outcome::Processed { .. }))
      .count();
    assert_eq!(processed, 1, "{a:?} / {b:?}");
    assert!(a == Outcome::Contended || b == Outcome::Contended, "{a:?} / {b:?}");
    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_interrupted_attempt_counts_toward_limit() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");

    // A previous run crashed mid-attempt
    {
      let mut journal = Journal::try_acquire(&ctx.layout.journal_path(&path), &LockSet::new()).unwrap();
      journal
        .append(JournalRecord::new(
          JournalState::Processing,
          None,
          ChangeKind::Created,
          "crashed",
          1,
        ))
        .unwrap();
    }

    let outcome = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;

    assert!(matches!(outcome, Outcome::Processed { attempt: 2, .. }), "{outcome:?}");
    assert_eq!(*handler.attempts_seen.lock().unwrap(), vec![1]);
  }

  #[tokio::test]
  async fn test_interrupted_final_attempt_moves_to_error_folder() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let observers = Observers::new();
    let mut events = observers.subscribe();
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), observers);
    let (envelope, path) = ctx.write_envelope(PING, "{}");
    let max = ctx.config.processor.max_attempts;

    // Crashed during the last allowed attempt
    {
      let mut journal = Journal::try_acquire(&ctx.layout.journal_path(&path), &LockSet::new()).unwrap();
      for attempt in 1..max {
        for state in [JournalState::Processing, JournalState::Failed] {
          journal
            .append(JournalRecord::new(state, None, ChangeKind::Created, "crashed", attempt))
            .unwrap();
        }
      }
      journal
        .append(JournalRecord::new(
          JournalState::Processing,
          None,
          ChangeKind::Created,
          "crashed",
          max,
        ))
        .unwrap();
    }

    let pending = crate::actor::backlog::pending_items(&ctx.layout, max);
    assert_eq!(pending.len(), 1);

    let outcome = processor.process(pending[0].clone(), &CancellationToken::new()).await;

    assert_eq!(outcome, Outcome::Exhausted { attempts: max });
    assert_eq!(handler.calls(), 0);
    assert_eq!(ctx.file_names(&ctx.layout.error), vec![envelope.file_name()]);
    let last = ctx.journal_records(&path).pop().unwrap();
    assert_eq!((last.state, last.attempt), (JournalState::Failed, max));
    assert!(matches!(
      events.try_recv(),
      Ok(ProcessorEvent::Exhausted { attempts, .. }) if attempts == max
    ));

    // Reported once; afterwards it is a plain exhausted item
    assert!(crate::actor::backlog::pending_items(&ctx.layout, max).is_empty());
    let again = processor
      .process(WorkItem::new(&path, ChangeKind::Created), &CancellationToken::new())
      .await;
    assert_eq!(again, Outcome::Skipped(SkipReason::Exhausted));
  }

  #[tokio::test]
  async fn test_cancelled_before_attempt() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let processor = ctx.processor(dispatcher_for(handler.clone()), LockSet::new(), Observers::new());
    let (_, path) = ctx.write_envelope(PING, "{}");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = processor.process(WorkItem::new(&path, ChangeKind::Created), &cancel).await;

    assert_eq!(outcome, Outcome::Skipped(SkipReason::Cancelled));
    assert_eq!(handler.calls(), 0);
    assert!(ctx.journal_records(&path).is_empty());
  }
}
