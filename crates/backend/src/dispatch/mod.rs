//! Routing envelopes to message handlers.
//!
//! Handlers are registered once, up front, in a [`HandlerRegistry`]. A
//! [`Dispatcher`] looks up every handler declared for the envelope's type key
//! and invokes them, either one after another ([`OrderedDispatcher`]) or
//! concurrently ([`ParallelDispatcher`]).

mod ordered;
mod parallel;

use std::{collections::HashMap, fmt, future::Future, path::PathBuf, sync::Arc};

use filebus_core::{Message, MessageEnvelope, MessageTypeKey};
use tokio_util::sync::CancellationToken;

pub use ordered::OrderedDispatcher;
pub use parallel::ParallelDispatcher;

// ============================================================================
// Attempt Context
// ============================================================================

/// Per-attempt state handed to handlers next to the envelope
#[derive(Debug, Clone)]
pub struct AttemptContext {
  /// 1-based attempt number for this work item
  pub attempt: u32,
  /// Identity of the processing instance
  pub instance_id: Arc<str>,
  /// Work file the envelope was read from
  pub source: PathBuf,
  /// Span the dispatch runs in; handlers may enter it from spawned work
  pub span: tracing::Span,
  /// Cancelled when the listener shuts down
  pub cancel: CancellationToken,
}

impl AttemptContext {
  pub fn new(attempt: u32, instance_id: Arc<str>, source: PathBuf, cancel: CancellationToken) -> Self {
    Self {
      attempt,
      instance_id,
      source,
      span: tracing::Span::none(),
      cancel,
    }
  }

  pub fn with_span(mut self, span: tracing::Span) -> Self {
    self.span = span;
    self
  }
}

// ============================================================================
// Handlers
// ============================================================================

/// Receives envelopes of the types it declares
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
  /// Name used in logs and failure reports
  fn name(&self) -> &str;

  /// Type keys this handler is registered for
  fn handled_types(&self) -> Vec<MessageTypeKey>;

  async fn on_next(&self, envelope: &MessageEnvelope, ctx: &AttemptContext) -> anyhow::Result<()>;

  /// Called after `on_next` failed for this envelope
  async fn on_error(&self, _envelope: &MessageEnvelope, _error: &anyhow::Error) {}
}

/// Closure-backed handler
pub struct FnHandler<F> {
  name: String,
  types: Vec<MessageTypeKey>,
  f: F,
}

impl<F, Fut> FnHandler<F>
where
  F: Fn(MessageEnvelope, AttemptContext) -> Fut + Send + Sync,
  Fut: Future<Output = anyhow::Result<()>> + Send,
{
  pub fn new(name: impl Into<String>, types: Vec<MessageTypeKey>, f: F) -> Self {
    Self {
      name: name.into(),
      types,
      f,
    }
  }

  /// Handler for a single message type
  pub fn for_message<M: Message>(name: impl Into<String>, f: F) -> Self {
    Self::new(name, vec![M::message_type()], f)
  }
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
  F: Fn(MessageEnvelope, AttemptContext) -> Fut + Send + Sync,
  Fut: Future<Output = anyhow::Result<()>> + Send,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn handled_types(&self) -> Vec<MessageTypeKey> {
    self.types.clone()
  }

  async fn on_next(&self, envelope: &MessageEnvelope, ctx: &AttemptContext) -> anyhow::Result<()> {
    (self.f)(envelope.clone(), ctx.clone()).await
  }
}

// ============================================================================
// Registry
// ============================================================================

/// Type key -> handlers, in registration order
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  routes: HashMap<MessageTypeKey, Vec<Arc<dyn MessageHandler>>>,
  count: usize,
}

impl HandlerRegistry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::default()
  }

  pub fn handlers_for(&self, key: &MessageTypeKey) -> &[Arc<dyn MessageHandler>] {
    self.routes.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Number of registered handlers
  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn message_types(&self) -> impl Iterator<Item = &MessageTypeKey> {
    self.routes.keys()
  }
}

impl fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let routes: HashMap<&MessageTypeKey, Vec<&str>> = self
      .routes
      .iter()
      .map(|(key, handlers)| (key, handlers.iter().map(|h| h.name()).collect()))
      .collect();
    f.debug_struct("HandlerRegistry").field("routes", &routes).finish()
  }
}

#[derive(Default)]
pub struct RegistryBuilder {
  handlers: Vec<Arc<dyn MessageHandler>>,
}

impl RegistryBuilder {
  pub fn handler(self, handler: impl MessageHandler + 'static) -> Self {
    self.shared(Arc::new(handler))
  }

  pub fn shared(mut self, handler: Arc<dyn MessageHandler>) -> Self {
    self.handlers.push(handler);
    self
  }

  pub fn build(self) -> HandlerRegistry {
    let mut routes: HashMap<MessageTypeKey, Vec<Arc<dyn MessageHandler>>> = HashMap::new();
    for handler in &self.handlers {
      let mut keys = handler.handled_types();
      keys.sort();
      keys.dedup();
      for key in keys {
        routes.entry(key).or_default().push(handler.clone());
      }
    }

    HandlerRegistry {
      routes,
      count: self.handlers.len(),
    }
  }
}

// ============================================================================
// Dispatchers
// ============================================================================

/// A handler that failed during one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
  pub handler: String,
  pub error: String,
}

impl fmt::Display for HandlerFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.handler, self.error)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error("No handlers registered for {0}")]
  NoHandlers(MessageTypeKey),

  #[error("Handler {0}")]
  Handler(HandlerFailure),

  #[error("{} handler(s) failed: {}", .0.len(), join_failures(.0))]
  Handlers(Vec<HandlerFailure>),
}

impl DispatchError {
  pub fn failures(&self) -> &[HandlerFailure] {
    match self {
      DispatchError::NoHandlers(_) => &[],
      DispatchError::Handler(failure) => std::slice::from_ref(failure),
      DispatchError::Handlers(failures) => failures,
    }
  }
}

fn join_failures(failures: &[HandlerFailure]) -> String {
  failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Delivers an envelope to every handler registered for its type.
///
/// Returns the number of handlers that ran successfully.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
  async fn dispatch(&self, envelope: Arc<MessageEnvelope>, ctx: &AttemptContext) -> Result<usize, DispatchError>;
}

/// Render a panic payload the way the standard hook would
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
