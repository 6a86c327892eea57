//! Publish command

use std::path::PathBuf;

use anyhow::{Context, Result};
use filebus::{FileSystemPublisher, MessagePublisher};
use filebus_core::{Config, MessageEnvelope};
use tokio::io::AsyncReadExt;

pub struct PublishArgs {
  pub message_type: String,
  pub file: Option<PathBuf>,
  pub json: Option<String>,
}

/// Publish a raw JSON payload under an explicit type key
pub async fn cmd_publish(config: &Config, args: PublishArgs) -> Result<()> {
  let raw = match (args.file, args.json) {
    (Some(path), _) => tokio::fs::read_to_string(&path)
      .await
      .with_context(|| format!("Failed to read {}", path.display()))?,
    (None, Some(json)) => json,
    (None, None) => {
      let mut buf = String::new();
      tokio::io::stdin()
        .read_to_string(&mut buf)
        .await
        .context("Failed to read payload from stdin")?;
      buf
    }
  };

  let envelope = MessageEnvelope::from_parts(args.message_type, normalize_payload(&raw)?);
  let publisher = FileSystemPublisher::new(&config.queue).context("Failed to prepare queue folder")?;
  let path = publisher.publish_envelope(&envelope).await?;

  println!("Published {} ({})", envelope.id, envelope.message_type);
  println!("  {}", path.display());
  Ok(())
}

/// Validate the payload and store it compactly
fn normalize_payload(raw: &str) -> Result<String> {
  let value: serde_json::Value = serde_json::from_str(raw.trim()).context("Payload is not valid JSON")?;
  Ok(serde_json::to_string(&value)?)
}
