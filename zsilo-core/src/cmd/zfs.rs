//! Command wrappers for executing and working with ZFS.

use crate::error::{Result, SiloError};
use crate::exec::SharedExecutor;
use crate::types::VolumeOption;
use std::fmt::Write as _;
use std::sync::Arc;

/// Typed interface to the `zfs` command line tool.
pub struct Zfs {
    executor: SharedExecutor,
}

impl Zfs {
    pub fn with(executor: &SharedExecutor) -> Self {
        Self { executor: Arc::clone(executor) }
    }

    /// Create a new zvol.
    ///
    /// `zfs create [-s] [-o property=value]... -V <size> <volume>`
    pub async fn create_volume(&self, args: CreateVolumeArgs<'_>) -> Result<()> {
        let mut cmd = String::from("zfs create");

        if args.sparse {
            cmd.push_str(" -s");
        }

        for option in args.options {
            let _ = write!(cmd, " -o {}={}", option.key, option.value);
        }

        let _ = write!(cmd, " -V {} {}", args.size, args.name);

        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Destroy a zvol.
    ///
    /// `zfs destroy <volume>`
    pub async fn destroy_volume(&self, args: DestroyVolumeArgs<'_>) -> Result<()> {
        let cmd = format!("zfs destroy {}", args.name);
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Check whether a dataset exists.
    ///
    /// Uses `zfs list -H -o name` piped through `grep -x` for an exact match;
    /// grep exiting 1 with empty stderr means the dataset is absent.
    pub async fn volume_exists(&self, args: VolumeExistsArgs<'_>) -> Result<bool> {
        let cmd = format!("zfs list -H -o name | grep -x {}", args.name);
        match self.executor.exec(&cmd).await {
            Ok(_) => Ok(true),
            Err(SiloError::CommandFailed(result))
                if result.exit_code == 1 && result.stderr.is_empty() =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Set a property on a dataset.
    ///
    /// `zfs set <property>=<value> <dataset>`
    pub async fn set_property(&self, args: SetPropertyArgs<'_>) -> Result<()> {
        let cmd = format!("zfs set '{}'='{}' '{}'", args.key, args.value, args.name);
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Get a property from a dataset.
    ///
    /// `zfs get -Hp -o value <property> <dataset>`
    ///
    /// Distinguishes "dataset does not exist", "dataset is busy" and "property
    /// not set" so callers can react to each; other failures carry stderr
    /// verbatim.
    pub async fn get_property(&self, args: GetPropertyArgs<'_>) -> Result<String> {
        let cmd = format!("zfs get -Hp -o value '{}' '{}'", args.key, args.name);
        let result = match self.executor.exec(&cmd).await {
            Ok(result) => result,
            Err(SiloError::CommandFailed(result)) => {
                let stderr = result.stderr.replace('\n', "");
                if stderr.contains("dataset does not exist") {
                    return Err(SiloError::NotFound(format!("dataset does not exist: {stderr}")));
                }
                if stderr.contains("dataset is busy") {
                    return Err(SiloError::FailedPrecondition(format!(
                        "dataset is busy: {stderr}"
                    )));
                }
                return Err(SiloError::CommandFailed(result));
            }
            Err(err) => return Err(err),
        };

        let value = result.stdout.trim_end_matches('\n');
        if value == "-" {
            return Err(SiloError::NotFound(format!(
                "property {} not set on {}",
                args.key, args.name
            )));
        }

        Ok(value.to_string())
    }
}

pub struct CreateVolumeArgs<'a> {
    pub name: &'a str,
    pub size: u64,
    pub options: &'a [VolumeOption],
    pub sparse: bool,
}

pub struct DestroyVolumeArgs<'a> {
    pub name: &'a str,
}

pub struct VolumeExistsArgs<'a> {
    pub name: &'a str,
}

pub struct SetPropertyArgs<'a> {
    pub name: &'a str,
    pub key: &'a str,
    pub value: &'a str,
}

pub struct GetPropertyArgs<'a> {
    pub name: &'a str,
    pub key: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockExecutor, Outcome};
    use crate::types::VolumeOption;

    #[tokio::test]
    async fn create_volume_renders_flags_and_options() {
        let mock = MockExecutor::new();
        let executor: SharedExecutor = mock.clone();
        let options = vec![
            VolumeOption { key: "volblocksize".into(), value: "16k".into() },
            VolumeOption { key: "compression".into(), value: "lz4".into() },
        ];

        Zfs::with(&executor)
            .create_volume(CreateVolumeArgs {
                name: "tank/vol_foo",
                size: 104857600,
                options: &options,
                sparse: true,
            })
            .await
            .unwrap();

        assert_eq!(
            mock.commands(),
            vec![
                "zfs create -s -o volblocksize=16k -o compression=lz4 -V 104857600 tank/vol_foo"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn volume_exists_interprets_grep_exit_one_as_absent() {
        let mock = MockExecutor::new().on("grep -x", Outcome::Exit(1, ""));
        let executor: SharedExecutor = mock.clone();

        let exists = Zfs::with(&executor)
            .volume_exists(VolumeExistsArgs { name: "tank/vol_foo" })
            .await
            .unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    async fn volume_exists_propagates_real_failures() {
        let mock = MockExecutor::new().on("grep -x", Outcome::Exit(1, "permission denied"));
        let executor: SharedExecutor = mock.clone();

        let err = Zfs::with(&executor)
            .volume_exists(VolumeExistsArgs { name: "tank/vol_foo" })
            .await
            .unwrap_err();
        assert!(matches!(err, SiloError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn get_property_distinguishes_stderr_kinds() {
        let mock = MockExecutor::new()
            .on("'avail' 'tank/gone'", Outcome::Exit(1, "cannot open: dataset does not exist\n"))
            .on("'avail' 'tank/busy'", Outcome::Exit(1, "cannot get: dataset is busy\n"))
            .on("'avail' 'tank/unset'", Outcome::Stdout("-\n"));
        let executor: SharedExecutor = mock.clone();
        let zfs = Zfs::with(&executor);

        let err = zfs.get_property(GetPropertyArgs { name: "tank/gone", key: "avail" }).await;
        assert!(matches!(err, Err(SiloError::NotFound(_))));

        let err = zfs.get_property(GetPropertyArgs { name: "tank/busy", key: "avail" }).await;
        assert!(matches!(err, Err(SiloError::FailedPrecondition(_))));

        let err = zfs.get_property(GetPropertyArgs { name: "tank/unset", key: "avail" }).await;
        assert!(matches!(err, Err(SiloError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_property_trims_trailing_newline() {
        let mock = MockExecutor::new().on("zfs get", Outcome::Stdout("1073741824\n"));
        let executor: SharedExecutor = mock.clone();

        let value = Zfs::with(&executor)
            .get_property(GetPropertyArgs { name: "tank", key: "avail" })
            .await
            .unwrap();
        assert_eq!(value, "1073741824");
    }
}
