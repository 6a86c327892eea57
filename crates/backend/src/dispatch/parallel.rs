use std::sync::Arc;

use filebus_core::MessageEnvelope;
use futures::future::join_all;
use tracing::{Instrument, debug, warn};

use super::{AttemptContext, DispatchError, Dispatcher, HandlerFailure, HandlerRegistry, panic_message};

/// Runs every matching handler in its own task.
///
/// All handlers run to completion; the dispatch fails if any of them failed or
/// panicked, listing every failure.
#[derive(Debug, Clone)]
pub struct ParallelDispatcher {
  registry: HandlerRegistry,
}

impl ParallelDispatcher {
  pub fn new(registry: HandlerRegistry) -> Self {
    Self { registry }
  }
}

#[async_trait::async_trait]
impl Dispatcher for ParallelDispatcher {
  async fn dispatch(&self, envelope: Arc<MessageEnvelope>, ctx: &AttemptContext) -> Result<usize, DispatchError> {
    let handlers = self.registry.handlers_for(&envelope.message_type);
    if handlers.is_empty() {
      return Err(DispatchError::NoHandlers(envelope.message_type.clone()));
    }

    let tasks = handlers.iter().map(|handler| {
      let handler = handler.clone();
      let envelope = envelope.clone();
      let ctx = ctx.clone();
      let span = ctx.span.clone();
      tokio::spawn(async move { handler.on_next(&envelope, &ctx).await }.instrument(span))
    });
    let results = join_all(tasks).await;

    let mut completed = 0;
    let mut failures = Vec::new();
    for (handler, result) in handlers.iter().zip(results) {
      let error = match result {
        Ok(Ok(())) => {
          debug!(handler = handler.name(), "Handler completed");
          completed += 1;
          continue;
        }
        Ok(Err(e)) => e,
        Err(join) if join.is_panic() => {
          anyhow::anyhow!("handler panicked: {}", panic_message(join.into_panic().as_ref()))
        }
        Err(join) => anyhow::anyhow!("handler task aborted: {}", join),
      };

      warn!(handler = handler.name(), error = %format!("{:#}", error), "Handler failed");
      handler.on_error(&envelope, &error).await;
      failures.push(HandlerFailure {
        handler: handler.name().to_string(),
        error: format!("{:#}", error),
      });
    }

    if failures.is_empty() {
      Ok(completed)
    } else {
      Err(DispatchError::Handlers(failures))
    }
  }
}
