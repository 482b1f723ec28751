//! Command-backed text understanding.
//!
//! `CommandUnderstanding` runs an external program with the request text as
//! its last argument and hands its stdout back as the raw response for the
//! classifier to parse.

use crate::error::{Error, Result};
use crate::orchestration::classifier::TextUnderstanding;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default timeout for one understanding call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Text understanding through an external command.
///
/// # Example
///
/// ```ignore
/// use swarm_router::orchestration::CommandUnderstanding;
///
/// let understanding = CommandUnderstanding::new("intent-cli").with_args(["--json"]);
/// let raw = understanding.understand("write unit tests for billing").await?;
/// ```
#[derive(Debug, Clone)]
pub struct CommandUnderstanding {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandUnderstanding {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Arguments placed before the request text.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TextUnderstanding for CommandUnderstanding {
    async fn understand(&self, text: &str) -> Result<String> {
        debug!(program = %self.program.display(), "invoking text understanding");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .arg(text)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::Classification(format!(
                "text understanding timed out after {:?}",
                self.timeout
            ))
        })?
        .map_err(|e| {
            Error::Classification(format!(
                "failed to run {}: {}",
                self.program.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "text understanding exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Classification(message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
