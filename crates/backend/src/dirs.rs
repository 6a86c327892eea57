/// Journals record at most this many characters of the instance id
pub const MAX_INSTANCE_ID_LEN: usize = 20;

/// Identity written into journal records by this process.
///
/// Reads `env_var` (e.g. `FILEBUS_INSTANCE_ID`, or a hosting platform's instance
/// variable) and falls back to the process id. Diagnostics only; locking never
/// depends on it.
pub fn instance_id(env_var: &str) -> String {
  normalize_instance_id(std::env::var(env_var).ok())
}

fn normalize_instance_id(raw: Option<String>) -> String {
  raw
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .map(|v| v.chars().take(MAX_INSTANCE_ID_LEN).collect())
    .unwrap_or_else(|| std::process::id().to_string())
}
