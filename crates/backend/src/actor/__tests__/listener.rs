#[cfg(test)]
mod tests {
  use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

  use pretty_assertions::assert_eq;
  use tokio_util::sync::CancellationToken;

  use crate::{
    FileSystemPublisher, ListenerError, MessagePublisher, QueueListener,
    actor::{
      __tests__::helpers::{BusTestContext, PING, ScriptedHandler, dispatcher_for, next_event, wait_for},
      message::ProcessorEvent,
    },
  };
  use filebus_core::{ConfigError, MessageEnvelope};

  const TIMEOUT: Duration = Duration::from_secs(10);

  #[tokio::test]
  async fn test_published_message_is_processed_and_swept() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(handler.clone())).unwrap();
    let mut events = listener.subscribe();
    let handle = listener.start(CancellationToken::new()).await.unwrap();

    let publisher = FileSystemPublisher::new(&ctx.config.queue).unwrap();
    let envelope = MessageEnvelope::from_parts(PING, r#"{"hello":"bus"}"#);
    let path = publisher.publish_envelope(&envelope).await.unwrap();

    let processed = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::Processed { .. })).await;
    assert_eq!(
      processed,
      Some(ProcessorEvent::Processed {
        path: path.clone(),
        id: envelope.id,
        attempt: 1
      })
    );

    let swept = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::Swept { .. })).await;
    assert_eq!(swept, Some(ProcessorEvent::Swept { path: path.clone() }));
    assert!(!path.exists());
    assert!(ctx.file_names(&ctx.layout.queue).is_empty());
    assert_eq!(ctx.file_names(&ctx.layout.completed), vec![envelope.file_name()]);
    assert_eq!(handler.handled(), vec![envelope.id]);

    handle.stop().await;
  }

  #[tokio::test]
  async fn test_failed_once_then_processed_and_swept() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::new(PING, 1));
    let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(handler.clone())).unwrap();
    let mut events = listener.subscribe();
    let handle = listener.start(CancellationToken::new()).await.unwrap();

    let publisher = FileSystemPublisher::new(&ctx.config.queue).unwrap();
    let envelope = MessageEnvelope::from_parts(PING, r#"{"retry":true}"#);
    let path = publisher.publish_envelope(&envelope).await.unwrap();

    let failed = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::AttemptFailed { .. })).await;
    assert!(
      matches!(failed, Some(ProcessorEvent::AttemptFailed { attempt: 1, .. })),
      "{failed:?}"
    );

    let processed = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::Processed { .. })).await;
    assert_eq!(
      processed,
      Some(ProcessorEvent::Processed {
        path: path.clone(),
        id: envelope.id,
        attempt: 2
      })
    );

    let swept = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::Swept { .. })).await;
    assert_eq!(swept, Some(ProcessorEvent::Swept { path: path.clone() }));
    assert!(!path.exists());
    assert!(!ctx.layout.journal_path(&path).exists());
    assert!(ctx.file_names(&ctx.layout.error).is_empty());
    assert_eq!(*handler.attempts_seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(handler.handled(), vec![envelope.id]);

    handle.stop().await;
  }

  #[tokio::test]
  async fn test_backlog_is_processed_at_startup() {
    let ctx = BusTestContext::with_config(|config| {
      config.sweeper.auto_delete = false;
    });
    let written: Vec<PathBuf> = (0..3).map(|i| ctx.write_envelope(PING, &format!("{{\"n\":{i}}}")).1).collect();

    let handler = Arc::new(ScriptedHandler::new(PING, 0));
    let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(handler.clone())).unwrap();
    let handle = listener.start(CancellationToken::new()).await.unwrap();

    let done = wait_for(TIMEOUT, || {
      let handler = handler.clone();
      async move { handler.calls() == 3 }
    })
    .await;
    assert!(done, "backlog not drained, calls = {}", handler.calls());

    handle.stop().await;

    // Without auto-delete the work files stay, each with a processed journal
    for path in written {
      assert!(path.exists());
      assert_eq!(ctx.journal_records(&path).len(), 2);
    }
  }

  #[tokio::test]
  async fn test_exhausted_item_lands_in_error_folder() {
    let ctx = BusTestContext::new();
    let handler = Arc::new(ScriptedHandler::always_failing(PING));
    let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(handler.clone())).unwrap();
    let mut events = listener.subscribe();
    let handle = listener.start(CancellationToken::new()).await.unwrap();

    let publisher = FileSystemPublisher::new(&ctx.config.queue).unwrap();
    let envelope = MessageEnvelope::from_parts(PING, "{}");
    let path = publisher.publish_envelope(&envelope).await.unwrap();

    let exhausted = next_event(&mut events, TIMEOUT, |e| matches!(e, ProcessorEvent::Exhausted { .. })).await;
    assert_eq!(exhausted, Some(ProcessorEvent::Exhausted { path: path.clone(), attempts: 3 }));
    assert_eq!(handler.calls(), 3);
    assert_eq!(ctx.file_names(&ctx.layout.error), vec![envelope.file_name()]);

    // Failed items are never swept
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(path.exists());
    assert_eq!(handler.calls(), 3);

    handle.stop().await;
  }

  #[tokio::test]
  async fn test_two_listeners_handle_each_message_once() {
    let ctx = BusTestContext::with_config(|config| {
      config.processor.max_concurrency = 2;
    });
    let handler = Arc::new(ScriptedHandler::new(PING, 0).with_delay(Duration::from_millis(10)));

    let mut handles = Vec::new();
    for _ in 0..2 {
      let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(handler.clone())).unwrap();
      handles.push(listener.start(CancellationToken::new()).await.unwrap());
    }

    let publisher = FileSystemPublisher::new(&ctx.config.queue).unwrap();
    let mut ids = HashSet::new();
    for n in 0..20 {
      let envelope = MessageEnvelope::from_parts(PING, format!("{{\"n\":{n}}}"));
      publisher.publish_envelope(&envelope).await.unwrap();
      ids.insert(envelope.id);
    }

    let done = wait_for(TIMEOUT, || {
      let handler = handler.clone();
      async move { handler.handled().len() >= 20 }
    })
    .await;
    assert!(done, "only {} of 20 handled", handler.handled().len());

    // Let both instances settle; nothing may be delivered twice
    tokio::time::sleep(Duration::from_millis(500)).await;
    let handled = handler.handled();
    assert_eq!(handled.len(), 20);
    assert_eq!(handled.into_iter().collect::<HashSet<_>>(), ids);

    for handle in handles {
      handle.stop().await;
    }
  }

  #[tokio::test]
  async fn test_missing_root_is_fatal() {
    let ctx = BusTestContext::new();
    let mut config = ctx.config.clone();
    config.queue.root_folder = ctx.root.path().join("does-not-exist");

    let listener = QueueListener::new(config, dispatcher_for(Arc::new(ScriptedHandler::new(PING, 0)))).unwrap();
    let result = listener.start(CancellationToken::new()).await;

    assert!(matches!(result, Err(ListenerError::MissingRoot(_))));
    assert!(!ctx.root.path().join("does-not-exist").exists());
  }

  #[tokio::test]
  async fn test_invalid_config_is_rejected() {
    let ctx = BusTestContext::new();
    let mut config = ctx.config.clone();
    config.processor.max_attempts = 0;

    let result = QueueListener::new(config, dispatcher_for(Arc::new(ScriptedHandler::new(PING, 0))));

    assert!(matches!(result, Err(ListenerError::Config(ConfigError::Invalid(_)))));
  }

  #[tokio::test]
  async fn test_stop_returns_after_cancel() {
    let ctx = BusTestContext::new();
    let listener = QueueListener::new(ctx.config.clone(), dispatcher_for(Arc::new(ScriptedHandler::new(PING, 0)))).unwrap();
    let cancel = CancellationToken::new();
    let handle = listener.start(cancel.clone()).await.unwrap();

    let waiter = tokio::spawn(handle.wait());
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .expect("listener did not stop")
      .unwrap();
  }
}
