//! Worker wire protocol
//!
//! The gateway talks to each deployment worker over its standard streams:
//!
//! - stdin: exactly one JSON line holding a [`WorkerRequest`], then EOF
//! - stdout: newline-delimited JSON [`WorkerMessage`]s tagged by `"type"`
//!
//! A worker reports any number of `progress` messages followed by exactly
//! one terminal message (`result` or `failure`). Its exit code carries no
//! meaning for the gateway.

use crate::bundle::Bundle;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Credentials forwarded to the worker so it can log into the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Job description sent to a worker on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: u64,
    pub name: String,
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    pub bundle: Bundle,
}

/// One line of worker output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Intermediate progress note, appended to the job log
    Progress { message: String },

    /// Deployment finished successfully
    Result {
        #[serde(default)]
        payload: Value,
    },

    /// Deployment engine reported an error
    Failure { detail: String },
}

impl WorkerMessage {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure {
            detail: detail.into(),
        }
    }
}

/// Encode a value as one protocol line (JSON followed by `\n`)
pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Decode one protocol line, ignoring surrounding whitespace
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}
