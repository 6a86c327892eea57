//! Logging setup for the listener and one-shot commands

use filebus_core::config::LoggingConfig;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "filebus.log";

/// Console logging for one-shot commands
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy(),
    )
    .with_target(false)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize logging for the listener.
///
/// Logs to the console unless `logging.directory` is set, in which case a
/// rolling file is used (no ANSI). RUST_LOG overrides the configured level.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_listener_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy();

  let Some(log_dir) = &config.directory else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  };

  if let Err(e) = std::fs::create_dir_all(log_dir) {
    eprintln!("Cannot create log directory {}: {}, logging to console", log_dir.display(), e);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE_NAME),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE_NAME),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
