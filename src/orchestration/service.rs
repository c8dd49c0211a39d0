//! The external analysis service boundary.
//!
//! The engine treats the service as a black box: `call(agent_id, payload,
//! params)` returns raw text or an error. Nothing about the text is assumed.

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code a service command uses to report temporary unavailability
/// (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ServiceError {
    #[error("service call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::Rejected(_))
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Timeout(d) => Error::Timeout(d),
            ServiceError::RateLimited(_) | ServiceError::Unavailable(_) => {
                Error::Transient(err.to_string())
            }
            ServiceError::Rejected(msg) => Error::Service(msg),
        }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn call(
        &self,
        agent_id: &str,
        payload: &str,
        params: &Value,
    ) -> std::result::Result<String, ServiceError>;
}

/// Runs a local command per call.
///
/// The command receives `--agent <id>` and `--params <json>` after the
/// configured args, and the payload on stdin. Stdout is the raw response.
#[derive(Debug, Clone)]
pub struct CommandService {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandService {
    /// Resolve the configured command on `PATH`.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let command = config.effective_command();
        let binary = which::which(command)
            .map_err(|_| Error::Validation(format!("service command '{}' not found", command)))?;
        Ok(Self {
            binary,
            args: config.args.clone(),
        })
    }

    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl AnalysisService for CommandService {
    async fn call(
        &self,
        agent_id: &str,
        payload: &str,
        params: &Value,
    ) -> std::result::Result<String, ServiceError> {
        debug!(agent_id, binary = %self.binary.display(), "invoking service command");
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg("--agent")
            .arg(agent_id)
            .arg("--params")
            .arg(params.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exit code {}", output.status.code().unwrap_or(-1))
        } else {
            stderr
        };
        match output.status.code() {
            Some(EXIT_TEMPFAIL) => Err(ServiceError::Unavailable(message)),
            _ => Err(ServiceError::Rejected(message)),
        }
    }
}

/// Apply `timeout` to a service call, mapping expiry to [`ServiceError::Timeout`].
pub async fn call_with_timeout(
    service: &dyn AnalysisService,
    timeout: Duration,
    agent_id: &str,
    payload: &str,
    params: &Value,
) -> std::result::Result<String, ServiceError> {
    tokio::time::timeout(timeout, service.call(agent_id, payload, params))
        .await
        .map_err(|_| ServiceError::Timeout(timeout))?
}
