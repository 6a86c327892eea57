//! Config commands (init, show)

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use filebus_core::{Config, config::LOCAL_CONFIG_FILE};

use super::load_config;

/// Show the effective configuration and where it came from
pub fn cmd_config_show(path: Option<&Path>, root: Option<PathBuf>) -> Result<()> {
  let config = load_config(path, root)?;

  match config_source(path) {
    Some(source) => println!("Using config: {}", source.display()),
    None => println!("Using default configuration (no config file found)"),
  }
  println!();

  // Show config as TOML
  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write the commented default config to ./filebus.toml
pub fn cmd_config_init(force: bool) -> Result<()> {
  let config_path = std::env::current_dir()?.join(LOCAL_CONFIG_FILE);

  if config_path.exists() && !force {
    bail!(
      "Config file already exists: {} (use --force to overwrite)",
      config_path.display()
    );
  }

  std::fs::write(&config_path, Config::generate_template())?;

  println!("Created config: {}", config_path.display());
  println!("Set queue.root_folder to the shared folder, then run `filebus listen`.");

  Ok(())
}

/// First config file `Config::load` would read
fn config_source(explicit: Option<&Path>) -> Option<PathBuf> {
  if let Some(path) = explicit {
    return Some(path.to_path_buf());
  }

  let local = std::env::current_dir().ok().map(|cwd| cwd.join(LOCAL_CONFIG_FILE));
  local
    .into_iter()
    .chain(Config::user_config_path())
    .find(|candidate| candidate.exists())
}
