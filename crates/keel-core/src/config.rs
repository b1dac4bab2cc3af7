use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (keel.toml + KEEL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Tuning knobs for the scheduler core, the worker pool and the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of job bodies running at the same time.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Submissions allowed to wait for a free worker before `PoolExhausted`.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Lateness tolerated before a firing is declared missed. Also the
    /// recovery window applied on startup.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// How long shutdown waits for in-flight executions.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on a single sleep of the timer loop. On every such wake the
    /// loop re-reads enabled jobs so writes from other instances are seen.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_base_ms")]
    pub store_retry_base_ms: u64,
    /// Per-subscriber publish budget; slower subscribers miss the event.
    #[serde(default = "default_event_send_timeout_ms")]
    pub event_send_timeout_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Applied to job definitions that do not carry their own misfire policy.
    #[serde(default = "default_max_instances")]
    pub default_max_instances: u32,
    #[serde(default)]
    pub default_coalesce: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            misfire_grace_secs: DEFAULT_MISFIRE_GRACE_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_base_ms: default_store_retry_base_ms(),
            event_send_timeout_ms: default_event_send_timeout_ms(),
            event_buffer: default_event_buffer(),
            default_max_instances: default_max_instances(),
            default_coalesce: false,
        }
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}
fn default_misfire_grace_secs() -> u64 {
    DEFAULT_MISFIRE_GRACE_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_resync_interval_secs() -> u64 {
    DEFAULT_RESYNC_INTERVAL_SECS
}
fn default_store_retry_attempts() -> u32 {
    3
}
fn default_store_retry_base_ms() -> u64 {
    200
}
fn default_event_send_timeout_ms() -> u64 {
    50
}
fn default_event_buffer() -> usize {
    1024
}
fn default_max_instances() -> u32 {
    1
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.keel/keel.db", home)
}

impl KeelConfig {
    /// Load config from a TOML file with KEEL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.keel/keel.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::KeelError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("KEEL_").split("__"))
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.keel/keel.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = KeelConfig::load(Some("/nonexistent/keel.toml")).unwrap();
        assert_eq!(config.scheduler.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.scheduler.default_max_instances, 1);
        assert!(!config.scheduler.default_coalesce);
        assert!(config.database.path.ends_with("keel.db"));
    }

    #[test]
    fn toml_overrides_individual_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(
            &path,
            "[scheduler]\npool_size = 2\nmisfire_grace_secs = 5\n\n[database]\npath = \"/tmp/x.db\"\n",
        )
        .unwrap();

        let config = KeelConfig::load(path.to_str()).unwrap();
        assert_eq!(config.scheduler.pool_size, 2);
        assert_eq!(config.scheduler.misfire_grace_secs, 5);
        // untouched fields keep their defaults
        assert_eq!(config.scheduler.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.database.path, "/tmp/x.db");
        assert_eq!(config.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn ensure_parent_dir_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConfig {
            path: dir.path().join("nested/state/keel.db").to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        db.ensure_parent_dir().unwrap();
        assert!(dir.path().join("nested/state").is_dir());
    }
}
