//! Publishing messages into a queue folder.
//!
//! Files are written under a temporary dot-name and renamed into place, so a
//! watcher only ever sees complete work files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use filebus_core::{EnvelopeError, Message, MessageEnvelope, config::QueueConfig};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::layout::QueueLayout;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
  #[error(transparent)]
  Envelope(#[from] EnvelopeError),

  #[error("Invalid file filter: {0}")]
  Filter(#[from] glob::PatternError),

  #[error("Failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
  /// Write a ready-made envelope; returns the path of the new work file
  async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<PathBuf, PublishError>;

  /// Wrap a typed message in a fresh envelope and publish it
  async fn publish<M: Message + Sync>(&self, message: &M) -> Result<PathBuf, PublishError>
  where
    Self: Sized,
  {
    let envelope = MessageEnvelope::new(message)?;
    self.publish_envelope(&envelope).await
  }
}

/// Publisher writing `<queue>/<id>.json` files
#[derive(Debug, Clone)]
pub struct FileSystemPublisher {
  queue: PathBuf,
}

impl FileSystemPublisher {
  /// Create the bus folders if needed and publish into its queue folder
  pub fn new(config: &QueueConfig) -> Result<Self, PublishError> {
    let layout = QueueLayout::from_config(config)?;
    layout.ensure().map_err(|source| PublishError::Write {
      path: layout.root.clone(),
      source,
    })?;
    Ok(Self { queue: layout.queue })
  }

  pub fn queue_folder(&self) -> &Path {
    &self.queue
  }
}

#[async_trait]
impl MessagePublisher for FileSystemPublisher {
  async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<PathBuf, PublishError> {
    let json = envelope.to_json()?;
    let temp = self.queue.join(format!(".{}.tmp", envelope.id));
    let target = self.queue.join(envelope.file_name());

    let write = async {
      let mut file = tokio::fs::File::create(&temp).await?;
      file.write_all(json.as_bytes()).await?;
      file.sync_all().await?;
      Ok::<_, std::io::Error>(())
    };
    if let Err(source) = write.await {
      let _ = tokio::fs::remove_file(&temp).await;
      return Err(PublishError::Write { path: temp, source });
    }

    tokio::fs::rename(&temp, &target)
      .await
      .map_err(|source| PublishError::Write {
        path: target.clone(),
        source,
      })?;

    debug!(envelope_id = %envelope.id, message_type = %envelope.message_type, "Message published");
    Ok(target)
  }
}
