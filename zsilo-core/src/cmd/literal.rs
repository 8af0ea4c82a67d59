//! Escape hatch for running ad-hoc shell commands.

use crate::error::{Result, SiloError};
use crate::exec::{CommandResult, SharedExecutor};
use std::sync::Arc;

pub struct Literal {
    executor: SharedExecutor,
}

impl Literal {
    pub fn with(executor: &SharedExecutor) -> Self {
        Self { executor: Arc::clone(executor) }
    }

    /// Execute a command and return the trimmed stdout.
    pub async fn run(&self, cmd: &str) -> Result<String> {
        let result = self.executor.exec(cmd).await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Execute a command and return stdout split into trimmed lines.
    pub async fn run_lines(&self, cmd: &str) -> Result<Vec<String>> {
        let stdout = self.run(cmd).await?;
        if stdout.is_empty() {
            return Ok(Vec::new());
        }
        Ok(stdout.lines().map(|line| line.trim().to_string()).collect())
    }

    /// Execute a command and return the full result regardless of exit code.
    /// Transport failures still error.
    pub async fn run_result(&self, cmd: &str) -> Result<CommandResult> {
        match self.executor.exec(cmd).await {
            Ok(result) => Ok(result),
            Err(SiloError::CommandFailed(result)) => Ok(result),
            Err(err) => Err(err),
        }
    }
}
