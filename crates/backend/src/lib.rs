pub mod actor;
pub mod dirs;
pub mod dispatch;
pub mod journal;
pub mod layout;

mod listener;
pub use listener::{ListenerError, ListenerHandle, QueueListener};

mod publish;
pub use publish::{FileSystemPublisher, MessagePublisher, PublishError};

pub use actor::{Outcome, ProcessorEvent, SkipReason};
pub use dispatch::{
  AttemptContext, DispatchError, Dispatcher, FnHandler, HandlerFailure, HandlerRegistry, MessageHandler,
  OrderedDispatcher, ParallelDispatcher,
};
pub use filebus_core::{ChangeKind, Config, ConfigError, EnvelopeError, Message, MessageEnvelope, MessageTypeKey, config};
