//! Common error types for guisrv

use thiserror::Error;

/// Common result type for guisrv operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the gateway and the deployer worker
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding error (bundle contents)
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}
