//! filebus CLI - filesystem message bus listener and tools

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{
  ListenArgs, PublishArgs, cmd_config_init, cmd_config_show, cmd_listen, cmd_publish, cmd_requeue, cmd_status,
  load_config,
};
use logging::{init_cli_logging, init_listener_logging};

#[derive(Parser)]
#[command(name = "filebus")]
#[command(about = "Message bus over a shared folder")]
#[command(after_help = "\
QUICK START:
  filebus config init                       # Write ./filebus.toml
  filebus listen --type orders.Placed       # Log every orders.Placed message
  filebus publish --type orders.Placed '{\"id\":1}'

HANDLING MESSAGES:
  filebus listen --type orders.Placed --exec ./handle.sh
      Pipes each envelope as JSON to the command; a non-zero exit is a failure
      and the message is retried.")]
struct Cli {
  /// Config file (default: ./filebus.toml, then the user config)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Override queue.root_folder
  #[arg(long, global = true, value_name = "DIR")]
  root: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `filebus config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show the effective configuration as TOML
  Show,

  /// Write a commented default config to ./filebus.toml
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Watch the queue folder and dispatch messages until Ctrl-C
  Listen {
    /// Message type key to handle (repeatable)
    #[arg(long = "type", value_name = "KEY", required = true)]
    types: Vec<String>,
    /// Shell command receiving each envelope as JSON on stdin
    #[arg(long, value_name = "CMD")]
    exec: Option<String>,
    /// Run handlers for one message concurrently instead of in order
    #[arg(long)]
    parallel: bool,
  },
  /// Publish a JSON payload as a message
  Publish {
    /// Message type key
    #[arg(long = "type", value_name = "KEY")]
    message_type: String,
    /// Read the payload from a file
    #[arg(long, value_name = "FILE", conflicts_with = "json")]
    file: Option<PathBuf>,
    /// Payload JSON (default: read stdin)
    json: Option<String>,
  },
  /// Show pending, failed and processed work items
  Status {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Move items from the error folder back into the queue
  Requeue {
    /// Envelope ids to requeue (default: all)
    ids: Vec<String>,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let (config_path, root) = (cli.config, cli.root);

  match cli.command {
    Commands::Listen { types, exec, parallel } => {
      let config = load_config(config_path.as_deref(), root)?;
      // Keep the guard alive so buffered file logs are flushed on exit
      let _guard = init_listener_logging(&config.logging);
      cmd_listen(config, ListenArgs { types, exec, parallel }).await
    }
    Commands::Publish {
      message_type,
      file,
      json,
    } => {
      init_cli_logging();
      let config = load_config(config_path.as_deref(), root)?;
      cmd_publish(
        &config,
        PublishArgs {
          message_type,
          file,
          json,
        },
      )
      .await
    }
    Commands::Status { json } => {
      init_cli_logging();
      cmd_status(&load_config(config_path.as_deref(), root)?, json)
    }
    Commands::Requeue { ids } => {
      init_cli_logging();
      cmd_requeue(&load_config(config_path.as_deref(), root)?, &ids)
    }

    // Config subcommands
    Commands::Config { command } => {
      init_cli_logging();
      match command {
        ConfigCommand::Show => cmd_config_show(config_path.as_deref(), root),
        ConfigCommand::Init { force } => cmd_config_init(force),
      }
    }
  }
}
