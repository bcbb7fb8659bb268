//! Resolved gateway configuration
//!
//! Built from the TOML layer ([`TomlConfig`]) after CLI/ENV overrides have
//! been applied by `main`. Everything downstream reads this struct only.

use guisrv_common::config::TomlConfig;
use guisrv_common::protocol::Credentials;
use guisrv_common::Result;
use std::path::PathBuf;
use std::time::Duration;

/// How long a worker may linger after its terminal message
pub const WORKER_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: String,
    pub api_url: String,
    pub legacy_paths: bool,
    /// Credentials for jobs submitted over HTTP
    pub http_credentials: Option<Credentials>,
    pub trace_frames: bool,
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub retry_worker_lost: bool,
    pub worker_command: PathBuf,
    pub worker_args: Vec<String>,
    pub worker_exit_grace: Duration,
}

impl GatewayConfig {
    /// Validate and flatten a TOML configuration
    pub fn from_toml(config: &TomlConfig) -> Result<Self> {
        config.validate()?;

        let http_credentials = match (&config.backend.user, &config.backend.password) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            listen: config.listen.clone(),
            api_url: config.backend.api_url.trim_end_matches('/').to_string(),
            legacy_paths: config.backend.legacy_paths,
            http_credentials,
            trace_frames: config.trace_frames,
            max_concurrent_jobs: config.scheduler.max_concurrent_jobs,
            job_timeout: Duration::from_secs(config.scheduler.job_timeout_secs),
            retry_worker_lost: config.scheduler.retry_worker_lost,
            worker_command: config.worker_command(),
            worker_args: config.worker.args.clone(),
            worker_exit_grace: WORKER_EXIT_GRACE,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let toml = TomlConfig::default();
        Self {
            listen: toml.listen.clone(),
            api_url: toml.backend.api_url.clone(),
            legacy_paths: false,
            http_credentials: None,
            trace_frames: false,
            max_concurrent_jobs: toml.scheduler.max_concurrent_jobs,
            job_timeout: Duration::from_secs(toml.scheduler.job_timeout_secs),
            retry_worker_lost: false,
            worker_command: toml.worker_command(),
            worker_args: Vec::new(),
            worker_exit_grace: WORKER_EXIT_GRACE,
        }
    }
}
