//! CLI command implementations

mod config;
mod listen;
mod publish;
mod requeue;
mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filebus_core::Config;

pub use config::{cmd_config_init, cmd_config_show};
pub use listen::{ListenArgs, cmd_listen};
pub use publish::{PublishArgs, cmd_publish};
pub use requeue::cmd_requeue;
pub use status::cmd_status;

/// Load the effective configuration, applying the `--root` override
pub fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<Config> {
  let mut config = Config::load(path).context("Failed to load configuration")?;
  if let Some(root) = root {
    config.queue.root_folder = root;
  }
  Ok(config)
}
