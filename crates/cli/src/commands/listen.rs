//! Listen command: run a queue listener until Ctrl-C

use std::{process::Stdio, sync::Arc};

use anyhow::{Context, Result, bail};
use filebus::{
  AttemptContext, Dispatcher, FnHandler, HandlerRegistry, MessageHandler, OrderedDispatcher, ParallelDispatcher,
  QueueListener,
};
use filebus_core::{Config, MessageEnvelope, MessageTypeKey};
use tokio::{io::AsyncWriteExt, process::Command, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ListenArgs {
  pub types: Vec<String>,
  pub exec: Option<String>,
  pub parallel: bool,
}

pub async fn cmd_listen(config: Config, args: ListenArgs) -> Result<()> {
  let registry = build_registry(&args);
  let dispatcher: Arc<dyn Dispatcher> = if args.parallel {
    Arc::new(ParallelDispatcher::new(registry))
  } else {
    Arc::new(OrderedDispatcher::new(registry))
  };

  let listener = QueueListener::new(config, dispatcher).context("Invalid configuration")?;
  let root = listener.layout().root.clone();

  // Master cancellation token - stops watcher, workers and sweeper
  let cancel = CancellationToken::new();
  let handle = listener
    .start(cancel.clone())
    .await
    .with_context(|| format!("Failed to start listener on {}", root.display()))?;

  info!(types = ?args.types, exec = args.exec.is_some(), "Listening, press Ctrl-C to stop");

  // Handle ctrl-c gracefully
  let cancel_for_signal = cancel.clone();
  tokio::spawn(async move {
    if let Err(e) = signal::ctrl_c().await {
      warn!("Failed to listen for ctrl-c: {}", e);
      return;
    }
    info!("Received ctrl-c, shutting down...");
    cancel_for_signal.cancel();
  });

  handle.wait().await;
  Ok(())
}

/// A logging handler per type, followed by the exec handler when requested
fn build_registry(args: &ListenArgs) -> HandlerRegistry {
  let keys: Vec<MessageTypeKey> = args.types.iter().map(MessageTypeKey::new).collect();

  let mut builder = HandlerRegistry::builder().handler(FnHandler::new(
    "log",
    keys.clone(),
    |envelope: MessageEnvelope, ctx: AttemptContext| async move {
      info!(
        envelope_id = %envelope.id,
        message_type = %envelope.message_type,
        attempt = ctx.attempt,
        content = %envelope.message_content,
        "Message received"
      );
      anyhow::Ok(())
    },
  ));

  if let Some(command) = &args.exec {
    builder = builder.handler(ExecHandler::new(command.clone(), keys));
  }

  builder.build()
}

// ============================================================================
// Exec handler
// ============================================================================

/// Pipes the envelope JSON to a shell command. A non-zero exit fails the attempt.
pub struct ExecHandler {
  command: String,
  types: Vec<MessageTypeKey>,
}

impl ExecHandler {
  pub fn new(command: String, types: Vec<MessageTypeKey>) -> Self {
    Self { command, types }
  }
}

#[async_trait::async_trait]
impl MessageHandler for ExecHandler {
  fn name(&self) -> &str {
    "exec"
  }

  fn handled_types(&self) -> Vec<MessageTypeKey> {
    self.types.clone()
  }

  async fn on_next(&self, envelope: &MessageEnvelope, ctx: &AttemptContext) -> anyhow::Result<()> {
    let json = envelope.to_json()?;

    let mut child = shell(&self.command)
      .env("FILEBUS_ENVELOPE_ID", envelope.id.to_string())
      .env("FILEBUS_MESSAGE_TYPE", envelope.message_type.as_str())
      .env("FILEBUS_ATTEMPT", ctx.attempt.to_string())
      .env("FILEBUS_SOURCE", &ctx.source)
      .stdin(Stdio::piped())
      .stdout(Stdio::inherit())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .with_context(|| format!("Failed to run {:?}", self.command))?;

    if let Some(mut stdin) = child.stdin.take()
      && let Err(e) = stdin.write_all(json.as_bytes()).await
      && e.kind() != std::io::ErrorKind::BrokenPipe
    {
      return Err(e).context("Failed to write envelope to command");
    }

    let output = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => bail!("Cancelled while {:?} was running", self.command),
        output = child.wait_with_output() => output.context("Failed to wait for command")?,
    };

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      bail!("{:?} exited with {}: {}", self.command, output.status, stderr.trim());
    }
    Ok(())
  }
}

fn shell(command: &str) -> Command {
  let mut cmd = if cfg!(windows) {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C");
    cmd
  } else {
    let mut cmd = Command::new("sh");
    cmd.arg("-c");
    cmd
  };
  cmd.arg(command);
  cmd
}
