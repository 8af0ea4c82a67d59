//! Command wrappers for the iSCSI target (`targetcli`) and initiator
//! (`iscsiadm`) sides, plus IQN construction.

use crate::error::Result;
use crate::exec::SharedExecutor;
use crate::strutil;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// An iSCSI Qualified Name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iqn(String);

impl Iqn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity used to derive IQNs: a naming-authority domain, the time the
/// authority took ownership of it, and the hostname.
#[derive(Debug, Clone)]
pub struct Host {
    domain: String,
    owner_time: DateTime<Utc>,
    hostname: String,
}

impl Host {
    pub fn new(
        domain: impl Into<String>,
        owner_time: DateTime<Utc>,
        hostname: impl Into<String>,
    ) -> Self {
        Self { domain: domain.into(), owner_time, hostname: hostname.into() }
    }

    /// The host IQN: `iqn.<yyyy-mm>.<reversed-domain>.<hostname>`, lowercased.
    ///
    /// A single-label domain gains a `.local` suffix before reversal so the
    /// naming authority has at least two labels.
    pub fn iqn(&self) -> Iqn {
        let mut parts: Vec<&str> = self.domain.split('.').collect();
        if parts.len() == 1 {
            parts.push("local");
        }
        parts.reverse();

        let value = format!(
            "iqn.{}.{}.{}",
            self.owner_time.format("%Y-%m"),
            parts.join("."),
            self.hostname,
        );
        Iqn(value.to_lowercase())
    }

    /// The IQN for a volume's target: `<host-iqn>:<volume-id>`, lowercased.
    pub fn volume_iqn(&self, volume_id: &str) -> Iqn {
        Iqn(format!("{}:{}", self.iqn(), volume_id).to_lowercase())
    }
}

/// CHAP credentials, including the mutual pair used to authenticate the
/// target back to the initiator.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
    pub mutual_user_id: String,
    pub mutual_password: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_empty()
            || self.password.is_empty()
            || self.mutual_user_id.is_empty()
            || self.mutual_password.is_empty()
    }
}

/// Typed interface to `targetcli` and `iscsiadm`.
pub struct Iscsi {
    executor: SharedExecutor,
}

impl Iscsi {
    pub fn with(executor: &SharedExecutor) -> Self {
        Self { executor: Arc::clone(executor) }
    }

    /// Create the backstore, target, LUN and CHAP configuration for a volume
    /// by piping a script into `targetcli` on the producer.
    pub async fn publish_volume(&self, args: PublishVolumeArgs<'_>) -> Result<()> {
        let script = strutil::multiline(&format!(
            "
            # Create a backstore with the block device.
            cd /backstores/block
            create {volume_id} {device_path}
            # Create the iSCSI target.
            cd /iscsi
            create {target_iqn}
            # Add LUN to the iSCSI target.
            cd /iscsi/{target_iqn}/tpg1/luns
            create /backstores/block/{volume_id}
            # Setup TPG authentication.
            cd /iscsi/{target_iqn}/tpg1
            set attribute demo_mode_write_protect=0
            set attribute generate_node_acls=1
            set attribute cache_dynamic_acls=1
            set auth userid={user_id}
            set auth password={password}
            set auth mutual_userid={mutual_user_id}
            set auth mutual_password={mutual_password}
            # Navigate back to root.
            cd /
            ",
            volume_id = args.volume_id,
            device_path = args.device_path,
            target_iqn = args.target_iqn,
            user_id = args.credentials.user_id,
            password = args.credentials.password,
            mutual_user_id = args.credentials.mutual_user_id,
            mutual_password = args.credentials.mutual_password,
        ));

        let cmd = format!("echo \"{script}\" | targetcli");
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Delete the target and backstore for a volume.
    pub async fn unpublish_volume(&self, args: UnpublishVolumeArgs<'_>) -> Result<()> {
        let script = strutil::multiline(&format!(
            "
            # Delete ISCSI target.
            cd /iscsi
            delete {target_iqn}
            # Delete backstore device.
            cd /backstores/block
            delete {volume_id}
            # Navigate back to root.
            cd /
            ",
            target_iqn = args.target_iqn,
            volume_id = args.volume_id,
        ));

        let cmd = format!("echo \"{script}\" | targetcli");
        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Register the target node on the consumer, configure CHAP in both
    /// directions, and log in. The steps are chained with `&&` so the login
    /// only runs when every update landed.
    pub async fn connect_target(&self, args: ConnectTargetArgs<'_>) -> Result<()> {
        let node = format!(
            "iscsiadm --mode node --targetname '{}' --portal \"{}\"",
            args.target_iqn, args.target_address,
        );
        let cmd = strutil::multiline(&format!(
            "
            ( {node} --op new ) &&
            ( {node} --op update --name node.session.auth.authmethod --value CHAP ) &&
            ( {node} --op update --name node.session.auth.username --value '{user_id}' ) &&
            ( {node} --op update --name node.session.auth.password --value '{password}' ) &&
            ( {node} --op update --name node.session.auth.username_in --value '{mutual_user_id}' ) &&
            ( {node} --op update --name node.session.auth.password_in --value '{mutual_password}' ) &&
            ( {node} --login )
            ",
            node = node,
            user_id = args.credentials.user_id,
            password = args.credentials.password,
            mutual_user_id = args.credentials.mutual_user_id,
            mutual_password = args.credentials.mutual_password,
        ))
        .replace('\n', " ");

        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Log out of the target and delete the node record.
    pub async fn disconnect_target(&self, args: DisconnectTargetArgs<'_>) -> Result<()> {
        let node = format!(
            "iscsiadm --mode node --targetname '{}' --portal \"{}\"",
            args.target_iqn, args.target_address,
        );
        let cmd = format!("( {node} --logout ) && ( {node} --op delete )");

        self.executor.exec(&cmd).await?;
        Ok(())
    }

    /// Rescan the session so the consumer kernel notices capacity growth.
    pub async fn rescan_target(&self, args: RescanTargetArgs<'_>) -> Result<()> {
        let cmd = format!(
            "iscsiadm --mode node --targetname '{}' --portal \"{}\" --rescan",
            args.target_iqn, args.target_address,
        );

        self.executor.exec(&cmd).await?;
        Ok(())
    }
}

pub struct PublishVolumeArgs<'a> {
    pub volume_id: &'a str,
    pub device_path: &'a str,
    pub target_iqn: &'a str,
    pub credentials: &'a Credentials,
}

pub struct UnpublishVolumeArgs<'a> {
    pub volume_id: &'a str,
    pub target_iqn: &'a str,
}

pub struct ConnectTargetArgs<'a> {
    pub target_iqn: &'a str,
    pub target_address: &'a str,
    pub credentials: &'a Credentials,
}

pub struct DisconnectTargetArgs<'a> {
    pub target_iqn: &'a str,
    pub target_address: &'a str,
}

pub struct RescanTargetArgs<'a> {
    pub target_iqn: &'a str,
    pub target_address: &'a str,
}
