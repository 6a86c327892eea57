//! Message envelopes and version-independent type keys.
//!
//! A [`MessageEnvelope`] is the unit of work that travels through the queue. It
//! wraps a serialized message together with the metadata the processor needs to
//! route and track it. Envelopes are stored on disk as camelCase JSON:
//!
//! ```json
//! {
//!   "id": "6f1c...",
//!   "messageType": "orders::OrderCreated",
//!   "messageContent": "{\"orderNumber\":\"ORD-001\"}",
//!   "datePublished": "2024-05-01T12:00:00Z",
//!   "attemptsCount": 0
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

// ============================================================================
// Type Keys
// ============================================================================

/// Stable routing key for a message type.
///
/// The key names the type and the crate that defines it, but never a crate
/// version, so a producer bumping its version keeps routing to existing
/// handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeKey(String);

impl MessageTypeKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// Derive the key for a Rust type as `<crate>::<TypeName>`.
  ///
  /// Only the defining crate and the bare type name are kept. Inner module
  /// paths and generic arguments are dropped, so moving a type between modules
  /// of the same crate keeps its key. Generic messages that need distinct keys
  /// must override [`Message::message_type`].
  pub fn of<T: ?Sized>() -> Self {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let name = base.rsplit("::").next().unwrap_or(base);
    match base.split_once("::") {
      Some((krate, _)) => Self(format!("{}::{}", krate, name)),
      None => Self(name.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The last path segment, e.g. `OrderCreated` for `shop::orders::OrderCreated`
  pub fn short_name(&self) -> &str {
    let base = self.0.split('<').next().unwrap_or(&self.0);
    base.rsplit("::").next().unwrap_or(base)
  }

  /// The first path segment, i.e. the defining crate when the key was built by [`MessageTypeKey::of`]
  pub fn module(&self) -> Option<&str> {
    let base = self.0.split('<').next().unwrap_or(&self.0);
    base.split_once("::").map(|(module, _)| module)
  }
}

impl fmt::Display for MessageTypeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for MessageTypeKey {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl From<String> for MessageTypeKey {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// A domain message that can be published on the bus.
///
/// The default type key is derived from the type path. Override
/// [`Message::message_type`] to pin a key that survives renames.
pub trait Message: Serialize + DeserializeOwned {
  fn message_type() -> MessageTypeKey {
    MessageTypeKey::of::<Self>()
  }
}

// ============================================================================
// Envelope
// ============================================================================

/// Errors raised while building or decoding envelopes
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
  #[error("Failed to serialize message: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("Failed to decode envelope: {0}")]
  Decode(#[source] serde_json::Error),

  #[error("Envelope carries {actual}, expected {expected}")]
  TypeMismatch {
    expected: MessageTypeKey,
    actual: MessageTypeKey,
  },

  #[error("Failed to decode {message_type} content: {source}")]
  Content {
    message_type: MessageTypeKey,
    #[source]
    source: serde_json::Error,
  },
}

/// Wrapper around a published message plus delivery metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
  /// Unique identifier, generated at publish time
  pub id: Uuid,
  /// Routing key of the wrapped message
  pub message_type: MessageTypeKey,
  /// The message serialized as JSON
  pub message_content: String,
  /// When the envelope was created
  pub date_published: DateTime<Utc>,
  /// Number of earlier delivery attempts; set by the processor, not the publisher
  #[serde(default)]
  pub attempts_count: u64,
}

impl MessageEnvelope {
  /// Wrap a typed message
  pub fn new<M: Message>(message: &M) -> Result<Self, EnvelopeError> {
    let content = serde_json::to_string(message).map_err(EnvelopeError::Serialize)?;
    Ok(Self::from_parts(M::message_type(), content))
  }

  /// Wrap already-serialized content under an explicit key
  pub fn from_parts(message_type: impl Into<MessageTypeKey>, content: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      message_type: message_type.into(),
      message_content: content.into(),
      date_published: Utc::now(),
      attempts_count: 0,
    }
  }

  /// Decode the wrapped message, checking the type key first
  pub fn message<M: Message>(&self) -> Result<M, EnvelopeError> {
    let expected = M::message_type();
    if expected != self.message_type {
      return Err(EnvelopeError::TypeMismatch {
        expected,
        actual: self.message_type.clone(),
      });
    }

    serde_json::from_str(&self.message_content).map_err(|source| EnvelopeError::Content {
      message_type: self.message_type.clone(),
      source,
    })
  }

  /// Decode the wrapped content as untyped JSON
  pub fn content_json(&self) -> Result<serde_json::Value, EnvelopeError> {
    serde_json::from_str(&self.message_content).map_err(|source| EnvelopeError::Content {
      message_type: self.message_type.clone(),
      source,
    })
  }

  pub fn is<M: Message>(&self) -> bool {
    self.message_type == M::message_type()
  }

  pub fn to_json(&self) -> Result<String, EnvelopeError> {
    serde_json::to_string(self).map_err(EnvelopeError::Serialize)
  }

  pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
    serde_json::from_str(json).map_err(EnvelopeError::Decode)
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
  }

  /// File name used for terminal copies (`<id>.json`)
  pub fn file_name(&self) -> String {
    format!("{}.json", self.id)
  }
}

/// Best-effort extraction of the envelope id from raw bytes that may not decode fully
pub fn peek_envelope_id(bytes: &[u8]) -> Option<Uuid> {
  #[derive(Deserialize)]
  struct IdOnly {
    id: Uuid,
  }

  serde_json::from_slice::<IdOnly>(bytes).ok().map(|v| v.id)
}
