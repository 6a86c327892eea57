//! Configuration system for filebus.
//!
//! Config priority: explicit path > ./filebus.toml > user (~/.config/filebus/config.toml) > defaults

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "filebus.toml";

// ============================================================================
// Change Kinds
// ============================================================================

/// Filesystem change that can cause a work item to be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Created,
  Changed,
  Renamed,
  Deleted,
}

impl ChangeKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ChangeKind::Created => "created",
      ChangeKind::Changed => "changed",
      ChangeKind::Renamed => "renamed",
      ChangeKind::Deleted => "deleted",
    }
  }
}

impl std::fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for ChangeKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "created" => Ok(ChangeKind::Created),
      "changed" => Ok(ChangeKind::Changed),
      "renamed" => Ok(ChangeKind::Renamed),
      "deleted" => Ok(ChangeKind::Deleted),
      _ => Err(format!("Unknown change kind: {}", s)),
    }
  }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("Config file not found: {0}")]
  NotFound(PathBuf),

  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Folder layout and work item selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Root of the bus; must exist before the listener starts
  pub root_folder: PathBuf,

  /// Work items land here (relative to root)
  pub queue_folder: String,

  /// Copies of successfully handled envelopes (relative to root)
  pub completed_folder: String,

  /// Copies of envelopes that exhausted their attempts (relative to root)
  pub error_folder: String,

  /// Glob matched against work file names
  pub filter: String,

  /// Journal files are named `<work file>.<journal_extension>`
  pub journal_extension: String,

  /// Which filesystem changes are turned into work
  pub change_types: Vec<ChangeKind>,

  /// Write `<completed>/<id>.json` after a successful dispatch
  pub keep_completed: bool,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      root_folder: PathBuf::from("filebus"),
      queue_folder: "queue".to_string(),
      completed_folder: "completed".to_string(),
      error_folder: "error".to_string(),
      filter: "*.json".to_string(),
      journal_extension: "status".to_string(),
      change_types: vec![ChangeKind::Created, ChangeKind::Renamed],
      keep_completed: true,
    }
  }
}

impl QueueConfig {
  pub fn queue_path(&self) -> PathBuf {
    self.root_folder.join(&self.queue_folder)
  }

  pub fn completed_path(&self) -> PathBuf {
    self.root_folder.join(&self.completed_folder)
  }

  pub fn error_path(&self) -> PathBuf {
    self.root_folder.join(&self.error_folder)
  }

  pub fn is_enabled(&self, kind: ChangeKind) -> bool {
    self.change_types.contains(&kind)
  }
}

// ============================================================================
// Processor Configuration
// ============================================================================

/// Worker pool, retry and change detection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
  /// Number of concurrent workers (default: 5)
  pub max_concurrency: usize,

  /// Queue capacity; 0 = unbounded (default: 0)
  pub max_queue_size: usize,

  /// Attempts per work item before it is moved to the error folder (default: 3)
  pub max_attempts: u32,

  /// Fixed pause before retrying a failed attempt (default: 3000)
  pub retry_backoff_ms: u64,

  /// Changed events this close to the file's creation time are ignored (default: 1000)
  pub change_debounce_ms: u64,

  /// Pause before handling each item, for virus scanners that lock new files (default: 0)
  pub scan_delay_secs: u64,

  /// Use a polling watcher instead of native notifications (network shares)
  pub use_polling: bool,

  /// Poll interval when use_polling is set (default: 2)
  pub poll_interval_secs: u64,

  /// How long stop() waits for in-flight work (default: 30)
  pub shutdown_timeout_secs: u64,

  /// Environment variable holding the instance id written to journals
  pub instance_id_env: String,
}

impl Default for ProcessorConfig {
  fn default() -> Self {
    Self {
      max_concurrency: 5,
      max_queue_size: 0,
      max_attempts: 3,
      retry_backoff_ms: 3000,
      change_debounce_ms: 1000,
      scan_delay_secs: 0,
      use_polling: false,
      poll_interval_secs: 2,
      shutdown_timeout_secs: 30,
      instance_id_env: "FILEBUS_INSTANCE_ID".to_string(),
    }
  }
}

impl ProcessorConfig {
  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }

  pub fn change_debounce(&self) -> Duration {
    Duration::from_millis(self.change_debounce_ms)
  }

  pub fn scan_delay(&self) -> Duration {
    Duration::from_secs(self.scan_delay_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout_secs)
  }
}

// ============================================================================
// Sweeper Configuration
// ============================================================================

/// Cleanup of fully processed work items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
  /// Delete processed work files and their journals (default: true)
  pub auto_delete: bool,

  /// Lower bound of the randomized sweep interval (default: 5000)
  pub min_interval_ms: u64,

  /// Upper bound of the randomized sweep interval (default: 8000)
  pub max_interval_ms: u64,

  /// Re-post pending items on each pass, picking up work skipped under contention (default: true)
  pub rescan_pending: bool,
}

impl Default for SweeperConfig {
  fn default() -> Self {
    Self {
      auto_delete: true,
      min_interval_ms: 5000,
      max_interval_ms: 8000,
      rescan_pending: true,
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// RUST_LOG overrides this when set
  pub level: String,

  /// Log file rotation: "daily", "hourly", "never"
  pub rotation: String,

  /// Write logs to files in this directory instead of stderr
  #[serde(skip_serializing_if = "Option::is_none")]
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
      directory: None,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub queue: QueueConfig,
  pub processor: ProcessorConfig,
  pub sweeper: SweeperConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load configuration.
  ///
  /// An explicit path must exist. Otherwise the first of `./filebus.toml` and
  /// the user config file that exists is used, falling back to defaults. A file
  /// that exists but does not parse is an error.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit {
      if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
      }
      return Self::load_from(path);
    }

    let local = std::env::current_dir()
      .map(|cwd| cwd.join(LOCAL_CONFIG_FILE))
      .ok();
    for candidate in local.into_iter().chain(Self::user_config_path()) {
      if candidate.exists() {
        return Self::load_from(&candidate);
      }
    }

    Ok(Self::default())
  }

  /// Parse a specific config file
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("filebus").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("filebus").join("config.toml"))
  }

  /// Reject settings the engine cannot run with
  pub fn validate(&self) -> Result<(), ConfigError> {
    let queue = &self.queue;

    if queue.root_folder.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("queue.root_folder must not be empty".into()));
    }

    let folders = [&queue.queue_folder, &queue.completed_folder, &queue.error_folder];
    if folders.iter().any(|f| f.trim().is_empty()) {
      return Err(ConfigError::Invalid("queue folder names must not be empty".into()));
    }
    let unique: HashSet<&String> = folders.iter().copied().collect();
    if unique.len() != folders.len() {
      return Err(ConfigError::Invalid(
        "queue, completed and error folders must be distinct".into(),
      ));
    }

    let ext = queue.journal_extension.as_str();
    if ext.is_empty() || ext.contains(['.', '/', '\\']) {
      return Err(ConfigError::Invalid(format!(
        "queue.journal_extension must be a bare extension, got {:?}",
        ext
      )));
    }

    if let Err(e) = glob::Pattern::new(&queue.filter) {
      return Err(ConfigError::Invalid(format!("queue.filter {:?}: {}", queue.filter, e)));
    }

    if queue.change_types.is_empty() {
      return Err(ConfigError::Invalid("queue.change_types must not be empty".into()));
    }

    if self.processor.max_concurrency == 0 {
      return Err(ConfigError::Invalid("processor.max_concurrency must be at least 1".into()));
    }

    if self.processor.max_attempts == 0 {
      return Err(ConfigError::Invalid("processor.max_attempts must be at least 1".into()));
    }

    if self.sweeper.min_interval_ms > self.sweeper.max_interval_ms {
      return Err(ConfigError::Invalid(format!(
        "sweeper.min_interval_ms ({}) exceeds sweeper.max_interval_ms ({})",
        self.sweeper.min_interval_ms, self.sweeper.max_interval_ms
      )));
    }

    // A processed file that keeps changing would be deleted under its writer
    if self.sweeper.auto_delete && queue.is_enabled(ChangeKind::Changed) {
      return Err(ConfigError::Invalid(
        "sweeper.auto_delete cannot be combined with the \"changed\" change type".into(),
      ));
    }

    Ok(())
  }

  /// Generate a default config file
  pub fn generate_template() -> String {
    r#"# filebus configuration
# Place in ./filebus.toml or ~/.config/filebus/config.toml (user)

# ============================================================================
# Queue Layout
# ============================================================================

[queue]
# Root folder of the bus (must exist)
root_folder = "filebus"

# Sub-folders of the root
queue_folder = "queue"
completed_folder = "completed"
error_folder = "error"

# Glob matched against work file names
filter = "*.json"

# Journals are stored next to each work file as <file>.<journal_extension>
journal_extension = "status"

# Change types that create work: created, changed, renamed, deleted
# "changed" cannot be combined with sweeper.auto_delete
change_types = ["created", "renamed"]

# Keep a copy of each successfully handled envelope in the completed folder
keep_completed = true

# ============================================================================
# Processor
# ============================================================================

[processor]
# Concurrent workers
max_concurrency = 5

# Queue capacity (0 = unbounded). A full queue delays the watcher.
max_queue_size = 0

# Attempts before an item is copied to the error folder
max_attempts = 3

# Fixed pause before each retry
retry_backoff_ms = 3000

# Changed events within this window of the file's creation time are ignored
change_debounce_ms = 1000

# Pause before handling each item (virus scanners)
scan_delay_secs = 0

# Poll instead of using native notifications (network shares)
use_polling = false
poll_interval_secs = 2

# How long shutdown waits for in-flight items
shutdown_timeout_secs = 30

# Environment variable that names this instance in journals
instance_id_env = "FILEBUS_INSTANCE_ID"

# ============================================================================
# Sweeper
# ============================================================================

[sweeper]
# Delete processed work items and their journals
auto_delete = true

# Sweeps run at a random interval within these bounds
min_interval_ms = 5000
max_interval_ms = 8000

# Re-post items that are still pending on each sweep
rescan_pending = true

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace (RUST_LOG overrides)
level = "info"

# daily, hourly, never
rotation = "daily"

# Log to files in this directory instead of stderr
# directory = "/var/log/filebus"
"#
    .to_string()
  }
}
