//! Shared types for the filebus message bus: envelopes, type keys and configuration.

pub mod config;
pub mod envelope;

pub use config::{ChangeKind, Config, ConfigError};
pub use envelope::{EnvelopeError, Message, MessageEnvelope, MessageTypeKey, peek_envelope_id};
