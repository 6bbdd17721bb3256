//! TOML-based configuration system for branchbase.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! [`AppConfig::validate`] enforces the few invariants the engine relies on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// HTTP surface settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Version-control engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Client-side batch accumulator settings.
    #[serde(default)]
    pub batch: BatchConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the SQLite database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/branchbase")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl DaemonConfig {
    /// Path of the SQLite database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("branchbase.db")
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3400`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Request body size limit in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Author recorded when a request names none in its body or in the
    /// `X-Author-Id` header.
    #[serde(default = "default_author")]
    pub default_author: String,
}

fn default_listen() -> String {
    "127.0.0.1:3400".into()
}
fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_author() -> String {
    "system".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            default_author: default_author(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tenant used when a request does not name one.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    /// Name of the default branch bootstrapped for each tenant.
    #[serde(default = "default_branch_name")]
    pub default_branch_name: String,

    /// How long a merge or rollback waits for the per-branch lock.
    #[serde(default = "default_merge_lock_timeout_ms")]
    pub merge_lock_timeout_ms: u64,

    /// Upper bound for one whole merge or rollback.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Maximum number of ancestors followed by an overlay walk.
    #[serde(default = "default_max_branch_depth")]
    pub max_branch_depth: usize,

    /// History page size when the caller gives no limit.
    #[serde(default = "default_history_limit")]
    pub history_default_limit: usize,
}

fn default_tenant() -> String {
    "default".into()
}
fn default_branch_name() -> String {
    "main".into()
}
fn default_merge_lock_timeout_ms() -> u64 {
    5_000
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}
fn default_max_branch_depth() -> usize {
    64
}
fn default_history_limit() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            default_branch_name: default_branch_name(),
            merge_lock_timeout_ms: default_merge_lock_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_branch_depth: default_max_branch_depth(),
            history_default_limit: default_history_limit(),
        }
    }
}

impl EngineConfig {
    pub fn merge_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_lock_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Seconds between automatic flushes; 0 disables the timer.
    #[serde(default)]
    pub auto_flush_interval_secs: u64,

    /// Maximum number of distinct pending changes per accumulator.
    #[serde(default = "default_max_pending_changes")]
    pub max_pending_changes: usize,
}

fn default_max_pending_changes() -> usize {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            auto_flush_interval_secs: 0,
            max_pending_changes: default_max_pending_changes(),
        }
    }
}

impl BatchConfig {
    /// The auto-flush period, or `None` when the timer is disabled.
    pub fn auto_flush_interval(&self) -> Option<Duration> {
        (self.auto_flush_interval_secs > 0)
            .then(|| Duration::from_secs(self.auto_flush_interval_secs))
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.listen.trim().is_empty() {
            return Err(invalid("web.listen", "listen address must not be empty"));
        }
        if self.web.max_body_bytes == 0 {
            return Err(invalid("web.max_body_bytes", "body limit must be > 0"));
        }
        if self.web.default_author.trim().is_empty() {
            return Err(invalid("web.default_author", "author must not be empty"));
        }
        if self.engine.default_tenant.trim().is_empty() {
            return Err(invalid("engine.default_tenant", "tenant must not be empty"));
        }
        if self.engine.default_branch_name.trim().is_empty() {
            return Err(invalid(
                "engine.default_branch_name",
                "branch name must not be empty",
            ));
        }
        if self.engine.merge_lock_timeout_ms == 0 {
            return Err(invalid("engine.merge_lock_timeout_ms", "timeout must be > 0"));
        }
        if self.engine.operation_timeout_ms == 0 {
            return Err(invalid("engine.operation_timeout_ms", "timeout must be > 0"));
        }
        if self.engine.max_branch_depth == 0 {
            return Err(invalid("engine.max_branch_depth", "depth must be > 0"));
        }
        if self.engine.history_default_limit == 0 {
            return Err(invalid("engine.history_default_limit", "limit must be > 0"));
        }
        if self.batch.max_pending_changes == 0 {
            return Err(invalid("batch.max_pending_changes", "limit must be > 0"));
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as TOML (used by `branchbase init`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}
