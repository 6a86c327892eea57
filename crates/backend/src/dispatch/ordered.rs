use std::{panic::AssertUnwindSafe, sync::Arc};

use filebus_core::MessageEnvelope;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{AttemptContext, DispatchError, Dispatcher, HandlerFailure, HandlerRegistry, panic_message};

/// Runs matching handlers one at a time in registration order.
///
/// The first failure stops the dispatch; later handlers do not run.
#[derive(Debug, Clone)]
pub struct OrderedDispatcher {
  registry: HandlerRegistry,
}

impl OrderedDispatcher {
  pub fn new(registry: HandlerRegistry) -> Self {
    Self { registry }
  }
}

#[async_trait::async_trait]
impl Dispatcher for OrderedDispatcher {
  async fn dispatch(&self, envelope: Arc<MessageEnvelope>, ctx: &AttemptContext) -> Result<usize, DispatchError> {
    let handlers = self.registry.handlers_for(&envelope.message_type);
    if handlers.is_empty() {
      return Err(DispatchError::NoHandlers(envelope.message_type.clone()));
    }

    let mut completed = 0;
    for handler in handlers {
      let result = AssertUnwindSafe(handler.on_next(&envelope, ctx)).catch_unwind().await;

      let error = match result {
        Ok(Ok(())) => {
          debug!(handler = handler.name(), "Handler completed");
          completed += 1;
          continue;
        }
        Ok(Err(e)) => e,
        Err(panic) => anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
      };

      warn!(handler = handler.name(), error = %format!("{:#}", error), "Handler failed");
      handler.on_error(&envelope, &error).await;

      return Err(DispatchError::Handler(HandlerFailure {
        handler: handler.name().to_string(),
        error: format!("{:#}", error),
      }));
    }

    Ok(completed)
  }
}
