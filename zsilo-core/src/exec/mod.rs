//! Command execution on local and remote hosts.
//!
//! Everything zsilo does to the world goes through [`Executor::exec`]: a
//! single shell command string handed to `sh -c`, with stdout, stderr and the
//! exit code captured. The producer (storage host) and every consumer
//! (client host) get their own executor; adapters in [`crate::cmd`] are thin
//! typed layers over this interface.

mod remote;

pub use remote::{RemoteConfig, RemoteExecutor};

use crate::error::{Result, SiloError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Uniform run-a-shell-command interface.
///
/// A non-zero exit code is reported as [`SiloError::CommandFailed`] carrying
/// the full [`CommandResult`], so callers can branch on exit codes that tools
/// use non-fatally (`grep -q`, `wipefs`, `mountpoint -q`).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, command: &str) -> Result<CommandResult>;
}

/// Shared handle to an executor.
pub type SharedExecutor = Arc<dyn Executor>;

/// Consumer executors keyed by initiator IQN. Built once at startup and
/// immutable for the orchestrator's lifetime.
pub type ConsumerMap = HashMap<String, SharedExecutor>;

/// Executes commands as a local subprocess via `sh -c`.
pub struct LocalExecutor {
    run_as_root: bool,
}

impl LocalExecutor {
    pub fn new(run_as_root: bool) -> Self {
        Self { run_as_root }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn exec(&self, command: &str) -> Result<CommandResult> {
        let output = if self.run_as_root {
            Command::new("sudo").args(["sh", "-c", command]).output().await
        } else {
            Command::new("sh").args(["-c", command]).output().await
        }
        .map_err(|e| SiloError::Exec(format!("failed to spawn shell: {e}")))?;

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // A missing code means the process died to a signal.
            exit_code: output.status.code().unwrap_or(-1),
        };

        if output.status.success() {
            Ok(result)
        } else {
            Err(SiloError::CommandFailed(result))
        }
    }
}
