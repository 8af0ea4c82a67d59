//! Command wrappers for making and resizing filesystems on block devices.

use crate::error::{Result, SiloError};
use crate::exec::SharedExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_EXISTS_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Typed interface to `mkfs.ext4`, `wipefs`, `resize2fs` and device probes.
pub struct Fs {
    executor: SharedExecutor,
}

impl Fs {
    pub fn with(executor: &SharedExecutor) -> Self {
        Self { executor: Arc::clone(executor) }
    }

    /// Check whether a block device exists, polling until the timeout.
    ///
    /// zvol device nodes appear asynchronously after `zfs create`, so a
    /// single `stat` is not enough.
    pub async fn exists(&self, args: ExistsArgs<'_>) -> Result<bool> {
        let timeout = args.timeout.unwrap_or(DEFAULT_EXISTS_TIMEOUT);
        let poll_interval = args.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        let deadline = Instant::now() + timeout;

        loop {
            if self.executor.exec(&format!("stat {}", args.device)).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() + poll_interval > deadline {
                return Err(SiloError::Internal(format!(
                    "timed out waiting for device {} to exist",
                    args.device
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Format a device as ext4.
    ///
    /// `-F` forces overwrite of any existing filesystem; `-m0` reserves no
    /// blocks for the super-user.
    pub async fn format(&self, args: FormatArgs<'_>) -> Result<()> {
        if args.wait_for_device {
            self.exists(ExistsArgs { device: args.device, timeout: None, poll_interval: None })
                .await?;
        }

        let cmd = format!("mkfs.ext4 -F -m0 '{}'", args.device);
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Remove all filesystem, RAID and partition-table signatures from a
    /// device. `wipefs` exits 1 when there were no signatures, which counts
    /// as success here.
    pub async fn clear(&self, args: ClearArgs<'_>) -> Result<()> {
        let cmd = format!("wipefs -a {}", args.device);
        match self.executor.exec(&cmd).await {
            Ok(_) => Ok(()),
            Err(SiloError::CommandFailed(result)) if result.exit_code == 1 => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Grow the filesystem on a device to fill it.
    pub async fn resize(&self, args: ResizeArgs<'_>) -> Result<()> {
        let cmd = format!("resize2fs '{}'", args.device);
        self.executor.exec(&cmd).await?;
        Ok(())
    }
}

pub struct ExistsArgs<'a> {
    pub device: &'a str,
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

pub struct FormatArgs<'a> {
    pub device: &'a str,
    pub wait_for_device: bool,
}

pub struct ClearArgs<'a> {
    pub device: &'a str,
}

pub struct ResizeArgs<'a> {
    pub device: &'a str,
}
