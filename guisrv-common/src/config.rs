//! Configuration loading and config file resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! This module owns layers 3 and 4. Binaries apply their CLI/ENV
//! overrides (clap `env`) on top of the loaded [`TomlConfig`] and then call
//! [`TomlConfig::validate`].
//!
//! A missing config file is never an error: the compiled defaults are used
//! and a warning is logged.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "GUISRV_CONFIG";

/// Name of the worker executable installed next to the gateway
pub const DEPLOYER_BINARY: &str = "guisrv-deployer";

/// Gateway configuration as read from TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// HTTP/WebSocket listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log every relayed frame at startup (can be toggled at runtime)
    #[serde(default)]
    pub trace_frames: bool,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control-plane API connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// WebSocket URL of the API server (`ws://` or `wss://`)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Use `/environment/{uuid}/api` instead of `/model/{uuid}/api`
    /// when deriving the backend URL from the client path
    #[serde(default)]
    pub legacy_paths: bool,

    /// Credentials used for jobs submitted over HTTP
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Job scheduling limits
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Maximum number of jobs in state Started at any instant
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds a worker may run before it is killed (45 minutes)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Retry a job once when its worker process disappears
    #[serde(default)]
    pub retry_worker_lost: bool,
}

/// Worker process command line
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Executable to spawn; defaults to `guisrv-deployer` next to the
    /// running binary
    #[serde(default)]
    pub command: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_url() -> String {
    "wss://127.0.0.1:17070".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_job_timeout_secs() -> u64 {
    45 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            trace_frames: false,
            backend: BackendConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            legacy_paths: false,
            user: None,
            password: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_secs: default_job_timeout_secs(),
            retry_worker_lost: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TomlConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from `path`
    ///
    /// Returns compiled defaults (with a warning) when no path is given or
    /// the file does not exist. A file that exists but cannot be parsed is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            warn!("No config file found, using compiled defaults");
            return Ok(Self::default());
        };

        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Check values that cannot be expressed in the TOML schema
    pub fn validate(&self) -> Result<()> {
        let url = &self.backend.api_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "backend.api_url must start with ws:// or wss://, got {}",
                url
            )));
        }
        if self.scheduler.max_concurrent_jobs < 1 {
            return Err(Error::Config(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.scheduler.job_timeout_secs < 1 {
            return Err(Error::Config(
                "scheduler.job_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.listen.trim().is_empty() {
            return Err(Error::Config("listen address is empty".to_string()));
        }
        Ok(())
    }

    /// Worker executable, falling back to [`default_worker_command`]
    pub fn worker_command(&self) -> PathBuf {
        self.worker
            .command
            .clone()
            .unwrap_or_else(default_worker_command)
    }
}

/// Locate the config file
///
/// 1. explicit path (CLI `--config`)
/// 2. `GUISRV_CONFIG`
/// 3. `~/.config/guisrv/config.toml` if it exists
/// 4. `/etc/guisrv/config.toml` if it exists
///
/// Returns `None` when nothing applies.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("guisrv").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/guisrv/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// `guisrv-deployer` in the directory of the running executable
///
/// Falls back to a bare name resolved through `PATH`.
pub fn default_worker_command() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEPLOYER_BINARY)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(DEPLOYER_BINARY))
}
