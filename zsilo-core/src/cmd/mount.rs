//! Command wrappers for mount, umount and mountpoint checks.

use crate::error::{Result, SiloError};
use crate::exec::SharedExecutor;
use std::sync::Arc;

/// Typed interface to `mount`, `umount` and `mountpoint`.
pub struct Mount {
    executor: SharedExecutor,
}

impl Mount {
    pub fn with(executor: &SharedExecutor) -> Self {
        Self { executor: Arc::clone(executor) }
    }

    pub async fn mount(&self, args: MountArgs<'_>) -> Result<()> {
        let cmd = match args.fs_type {
            Some(fs_type) => format!(
                "mount -t {} -o '{}' '{}' '{}'",
                fs_type,
                args.options.join(","),
                args.source_path,
                args.target_path,
            ),
            None => format!(
                "mount -o '{}' '{}' '{}'",
                args.options.join(","),
                args.source_path,
                args.target_path,
            ),
        };
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    pub async fn umount(&self, args: UmountArgs<'_>) -> Result<()> {
        let cmd = format!("umount '{}'", args.path);
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Check whether a path is a mount point via `mountpoint -q`. A non-zero
    /// exit means "not a mountpoint", not an error; transport failures still
    /// propagate.
    pub async fn is_mounted(&self, path: &str) -> Result<bool> {
        let cmd = format!("mountpoint -q {path}");
        match self.executor.exec(&cmd).await {
            Ok(_) => Ok(true),
            Err(SiloError::CommandFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

pub struct MountArgs<'a> {
    pub source_path: &'a str,
    pub target_path: &'a str,
    pub fs_type: Option<&'a str>,
    pub options: &'a [&'a str],
}

pub struct UmountArgs<'a> {
    pub path: &'a str,
}
